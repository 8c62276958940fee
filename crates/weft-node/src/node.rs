//! A node: one participant in the fabric, owning its links to other nodes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use weft_core::{LinkSide, LinkType, NodeName, SublinkId};
use weft_router::node_link::NodeLink as NodeLinkApi;
use weft_router::Router;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::memory::LinkMemory;
use crate::node_link::NodeLink;
use crate::portal::Portal;
use crate::transport::MemoryTransport;

pub struct Node {
    name: NodeName,
    config: NodeConfig,
    links: Mutex<HashMap<NodeName, Arc<NodeLink>>>,
}

impl Node {
    /// A node with a freshly generated name and default configuration.
    pub fn new() -> Arc<Node> {
        Arc::new(Node {
            name: NodeName::generate(),
            config: NodeConfig::default(),
            links: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_config(config: NodeConfig) -> Result<Arc<Node>, NodeError> {
        let name = config.node.resolve_name()?;
        Ok(Arc::new(Node {
            name,
            config,
            links: Mutex::new(HashMap::new()),
        }))
    }

    pub fn name(&self) -> NodeName {
        self.name
    }

    /// A connected portal pair local to this node.
    pub fn create_portal_pair(&self) -> (Portal, Portal) {
        let (a, b) = Router::new_pair();
        (Portal::from_router(a), Portal::from_router(b))
    }

    pub(crate) fn get_link(&self, name: NodeName) -> Option<Arc<NodeLink>> {
        self.links.lock().get(&name).cloned()
    }

    pub(crate) fn forget_link(&self, name: NodeName) {
        self.links.lock().remove(&name);
    }

    /// Connect two nodes with an in-memory transport, producing one initial
    /// portal pair spanning them.
    pub fn connect(node_a: &Arc<Node>, node_b: &Arc<Node>) -> Connection {
        let memory = LinkMemory::new(node_a.config.memory.link_state_capacity);
        let (transport_a, transport_b) = MemoryTransport::pair();

        let link_a = NodeLink::new(
            node_a.clone(),
            node_a.name,
            node_b.name,
            transport_a,
            memory.clone(),
        );
        let link_b = NodeLink::new(
            node_b.clone(),
            node_b.name,
            node_a.name,
            transport_b,
            memory.clone(),
        );
        node_a.links.lock().insert(node_b.name, link_a.clone());
        node_b.links.lock().insert(node_a.name, link_b.clone());

        tracing::debug!(a = %node_a.name, b = %node_b.name, "nodes connected");

        // One initial portal pair over the reserved sublink 0, with its
        // link state in the fixed region of the shared pool.
        let router_a = Router::new();
        let router_b = Router::new();
        let fragment = memory.initial_router_link_state(0);
        let initial_sublink = SublinkId(0);
        let remote_a = link_a.add_remote_router_link(
            initial_sublink,
            fragment.clone(),
            LinkType::Central,
            LinkSide::A,
            router_a.clone(),
        );
        let remote_b = link_b.add_remote_router_link(
            initial_sublink,
            fragment,
            LinkType::Central,
            LinkSide::B,
            router_b.clone(),
        );
        if let (Some(remote_a), Some(remote_b)) = (remote_a, remote_b) {
            router_a.set_outward_link(remote_a);
            router_b.set_outward_link(remote_b);
        }

        Connection {
            portal_a: Portal::from_router(router_a),
            portal_b: Portal::from_router(router_b),
            link_a,
        }
    }
}

/// The result of connecting two nodes: the initial spanning portal pair and
/// a handle on the underlying link for fault injection.
pub struct Connection {
    pub portal_a: Portal,
    pub portal_b: Portal,
    link_a: Arc<NodeLink>,
}

impl Connection {
    /// Split into the two portals, dropping the fault-injection handle.
    pub fn into_portals(self) -> (Portal, Portal) {
        (self.portal_a, self.portal_b)
    }

    /// Kill the transport between the two nodes.
    pub fn sever(&self) {
        self.link_a.sever();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodes_have_distinct_names() {
        let a = Node::new();
        let b = Node::new();
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn config_pins_node_name() {
        let config = NodeConfig::from_toml_str(
            r#"
            [node]
            name = "0102030405060708090a0b0c0d0e0f10"
            "#,
        )
        .expect("config parses");
        let node = Node::with_config(config).expect("valid name");
        assert_eq!(node.name().as_bytes()[0], 0x01);
    }

    #[test]
    fn connect_registers_links_both_ways() {
        let a = Node::new();
        let b = Node::new();
        let connection = Node::connect(&a, &b);
        assert!(a.get_link(b.name()).is_some());
        assert!(b.get_link(a.name()).is_some());
        drop(connection);
    }
}
