//! Portal transfer across nodes: route extension, proxying, and the bypass
//! that collapses the proxy away.

use std::sync::Arc;

use weft_core::ApiError;
use weft_node::{Attachment, Node};

fn receive_portal(data: &[u8], carrier: &weft_node::Portal) -> weft_node::Portal {
    let (payload, mut attachments) = carrier.get().expect("carrier parcel");
    assert_eq!(payload.as_ref(), data);
    assert_eq!(attachments.len(), 1);
    match attachments.pop() {
        Some(Attachment::Portal(portal)) => portal,
        _ => panic!("expected a portal attachment"),
    }
}

#[test]
fn transferred_portal_keeps_ordering_and_releases_the_proxy() {
    let n1 = Node::new();
    let n2 = Node::new();
    let connection = Node::connect(&n1, &n2);

    let (p, q) = n1.create_portal_pair();
    p.put(b"before").expect("put before transfer");
    let proxy = Arc::downgrade(q.router());

    connection
        .portal_a
        .put_with_attachments(b"carrier", vec![Attachment::Portal(q)])
        .expect("transfer q to n2");
    let q2 = receive_portal(b"carrier", &connection.portal_b);

    // Concurrent traffic in both directions across the extended route.
    for i in 0..3u8 {
        p.put(&[b'p', i]).expect("put from p");
        q2.put(&[b'q', i]).expect("put from q2");
    }

    // The pre-transfer parcel arrives first, then everything in order.
    let (data, _) = q2.get().expect("pre-transfer parcel");
    assert_eq!(data.as_ref(), b"before");
    for i in 0..3u8 {
        let (data, _) = q2.get().expect("p parcel");
        assert_eq!(data.as_ref(), &[b'p', i]);
        let (data, _) = p.get().expect("q2 parcel");
        assert_eq!(data.as_ref(), &[b'q', i]);
    }

    // The bypass retired the proxy: nothing keeps its router alive.
    assert!(proxy.upgrade().is_none());

    // The route keeps working on the direct link.
    p.put(b"direct").expect("put after bypass");
    let (data, _) = q2.get().expect("direct parcel");
    assert_eq!(data.as_ref(), b"direct");
}

#[test]
fn transfer_resumes_sequences_mid_stream() {
    let n1 = Node::new();
    let n2 = Node::new();
    let connection = Node::connect(&n1, &n2);

    let (p, q) = n1.create_portal_pair();
    p.put(b"a").expect("put a");
    p.put(b"b").expect("put b");
    let (data, _) = q.get().expect("get a");
    assert_eq!(data.as_ref(), b"a");
    q.put(b"pre").expect("put pre");
    let (data, _) = p.get().expect("get pre");
    assert_eq!(data.as_ref(), b"pre");

    connection
        .portal_a
        .put_with_attachments(b"carrier", vec![Attachment::Portal(q)])
        .expect("transfer");
    let q2 = receive_portal(b"carrier", &connection.portal_b);

    // Inbound continues at the next unconsumed number...
    let (data, _) = q2.get().expect("get b");
    assert_eq!(data.as_ref(), b"b");
    // ...and outbound continues where the transferred router left off.
    q2.put(b"post").expect("put post");
    let (data, _) = p.get().expect("get post");
    assert_eq!(data.as_ref(), b"post");
}

#[test]
fn transfer_of_portal_whose_peer_already_closed() {
    let n1 = Node::new();
    let n2 = Node::new();
    let connection = Node::connect(&n1, &n2);

    let (p, q) = n1.create_portal_pair();
    p.put(b"parting").expect("put");
    p.close();

    connection
        .portal_a
        .put_with_attachments(b"carrier", vec![Attachment::Portal(q)])
        .expect("transfer");
    let q2 = receive_portal(b"carrier", &connection.portal_b);

    assert!(q2.is_peer_closed());
    let (data, _) = q2.get().expect("parcel sent before closure");
    assert_eq!(data.as_ref(), b"parting");
    assert_eq!(q2.get().unwrap_err(), ApiError::NotFound);
    assert!(q2.is_route_dead());
}

#[test]
fn closure_propagates_across_the_extended_route() {
    let n1 = Node::new();
    let n2 = Node::new();
    let connection = Node::connect(&n1, &n2);

    let (p, q) = n1.create_portal_pair();
    connection
        .portal_a
        .put_with_attachments(b"carrier", vec![Attachment::Portal(q)])
        .expect("transfer");
    let q2 = receive_portal(b"carrier", &connection.portal_b);

    q2.put(b"x").expect("put");
    q2.close();

    let (data, _) = p.get().expect("parcel before closure");
    assert_eq!(data.as_ref(), b"x");
    assert!(p.is_peer_closed());
    assert_eq!(p.get().unwrap_err(), ApiError::NotFound);
    assert!(p.is_route_dead());
}

#[test]
fn relay_hop_is_bypassed_between_three_nodes() {
    let n1 = Node::new();
    let n2 = Node::new();
    let n3 = Node::new();
    let (a1, a2) = Node::connect(&n1, &n2).into_portals();
    let (b2, b3) = Node::connect(&n2, &n3).into_portals();
    // The direct n1–n3 link the bypass will land on.
    let _direct = Node::connect(&n1, &n3).into_portals();

    // Move a2 from n2 to n3; its peer a1 stays on n1, leaving a relay hop
    // on n2 until the bypass removes it.
    b2.put_with_attachments(b"carrier", vec![Attachment::Portal(a2)])
        .expect("transfer a2 to n3");
    let a2 = receive_portal(b"carrier", &b3);

    for i in 0..3u8 {
        a1.put(&[b'a', i]).expect("put from n1");
        a2.put(&[b'z', i]).expect("put from n3");
    }
    for i in 0..3u8 {
        let (data, _) = a2.get().expect("in order at n3");
        assert_eq!(data.as_ref(), &[b'a', i]);
        let (data, _) = a1.get().expect("in order at n1");
        assert_eq!(data.as_ref(), &[b'z', i]);
    }

    // Closure still propagates once the relay is gone.
    a1.close();
    assert!(a2.is_peer_closed());
    assert_eq!(a2.get().unwrap_err(), ApiError::NotFound);
    assert!(a2.is_route_dead());
}

#[test]
fn blob_attachments_travel_with_their_parcel() {
    let n1 = Node::new();
    let n2 = Node::new();
    let connection = Node::connect(&n1, &n2);

    connection
        .portal_a
        .put_with_attachments(
            b"with-blob",
            vec![Attachment::Blob(bytes::Bytes::from_static(b"driver-object"))],
        )
        .expect("put blob");

    let (data, attachments) = connection.portal_b.get().expect("get");
    assert_eq!(data.as_ref(), b"with-blob");
    assert_eq!(attachments.len(), 1);
    match &attachments[0] {
        Attachment::Blob(blob) => assert_eq!(blob.as_ref(), b"driver-object"),
        Attachment::Portal(_) => panic!("expected a blob"),
    }
}
