use crate::audio::port::{PortArena, PortFlow, PortId, PortType, ResolvedSource};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while editing the connection graph; the registry is left
/// untouched whenever one of these is returned
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("signal type mismatch between source and destination")]
    TypeMismatch,
    #[error("cannot connect a port to itself")]
    SelfConnection,
    #[error("connection direction must be output to input")]
    FlowMismatch,
    #[error("connection would create a cycle")]
    WouldCreateCycle,
    #[error("no such port or connection")]
    NotFound,
}

/// Directed edge between two ports
#[derive(Debug, Clone, Copy)]
pub struct PortConnection {
    pub src: PortId,
    pub dest: PortId,
    /// Gain applied to the source's contribution
    pub multiplier: f32,
    /// Locked connections are engine-made and hidden from user editing
    pub locked: bool,
    /// Disabled connections stay in the registry but contribute nothing
    pub enabled: bool,
}

/// Registry of every port-to-port connection in the project
///
/// Connections are weak references by id; buffers and summing live on the
/// ports themselves. After any edit the registry is re-resolved into each
/// destination port's cached source list.
pub struct PortConnections {
    connections: Vec<PortConnection>,
}

impl PortConnections {
    pub fn new() -> Self {
        Self {
            connections: Vec::new(),
        }
    }

    /// All connections
    pub fn as_slice(&self) -> &[PortConnection] {
        &self.connections
    }

    /// Connect `src` to `dest`, validating types, direction and acyclicity
    ///
    /// `internal_edges` carries the input-to-output flow inside each module
    /// (plugin, fader, processor), so feedback through a module chain is
    /// caught even though it never appears as a port-to-port edge.
    pub fn connect(
        &mut self,
        arena: &PortArena,
        internal_edges: &[(PortId, PortId)],
        src: PortId,
        dest: PortId,
        locked: bool,
    ) -> Result<(), ConnectionError> {
        if src == dest {
            return Err(ConnectionError::SelfConnection);
        }
        let src_port = arena.get(src).ok_or(ConnectionError::NotFound)?;
        let dest_port = arena.get(dest).ok_or(ConnectionError::NotFound)?;

        if src_port.flow != PortFlow::Output || dest_port.flow != PortFlow::Input {
            return Err(ConnectionError::FlowMismatch);
        }

        // Types must match, except CV is allowed to modulate a control
        let compatible = src_port.port_type == dest_port.port_type
            || (src_port.port_type == PortType::Cv
                && dest_port.port_type == PortType::Control);
        if !compatible {
            return Err(ConnectionError::TypeMismatch);
        }

        // Already connected: keep the existing edge untouched
        if self.find(src, dest).is_some() {
            return Ok(());
        }

        if self.would_create_cycle(internal_edges, src, dest) {
            return Err(ConnectionError::WouldCreateCycle);
        }

        self.connections.push(PortConnection {
            src,
            dest,
            multiplier: 1.0,
            locked,
            enabled: true,
        });
        Ok(())
    }

    /// Remove the connection from `src` to `dest`
    pub fn disconnect(&mut self, src: PortId, dest: PortId) -> Result<(), ConnectionError> {
        let idx = self
            .connections
            .iter()
            .position(|c| c.src == src && c.dest == dest)
            .ok_or(ConnectionError::NotFound)?;
        self.connections.remove(idx);
        Ok(())
    }

    /// Remove every connection that touches the given port
    pub fn disconnect_all_for_port(&mut self, port: PortId) {
        self.connections
            .retain(|c| c.src != port && c.dest != port);
    }

    /// Set the gain multiplier on an existing connection
    pub fn set_multiplier(
        &mut self,
        src: PortId,
        dest: PortId,
        multiplier: f32,
    ) -> Result<(), ConnectionError> {
        let conn = self.find_mut(src, dest).ok_or(ConnectionError::NotFound)?;
        conn.multiplier = multiplier;
        Ok(())
    }

    /// Enable or disable an existing connection
    pub fn set_enabled(
        &mut self,
        src: PortId,
        dest: PortId,
        enabled: bool,
    ) -> Result<(), ConnectionError> {
        let conn = self.find_mut(src, dest).ok_or(ConnectionError::NotFound)?;
        conn.enabled = enabled;
        Ok(())
    }

    /// Find a connection by endpoints
    pub fn find(&self, src: PortId, dest: PortId) -> Option<&PortConnection> {
        self.connections
            .iter()
            .find(|c| c.src == src && c.dest == dest)
    }

    fn find_mut(&mut self, src: PortId, dest: PortId) -> Option<&mut PortConnection> {
        self.connections
            .iter_mut()
            .find(|c| c.src == src && c.dest == dest)
    }

    /// Connections arriving at `dest`
    pub fn sources_of<'a>(
        &'a self,
        dest: PortId,
    ) -> impl Iterator<Item = &'a PortConnection> + 'a {
        self.connections.iter().filter(move |c| c.dest == dest)
    }

    /// Connections leaving `src`
    pub fn dests_of<'a>(&'a self, src: PortId) -> impl Iterator<Item = &'a PortConnection> + 'a {
        self.connections.iter().filter(move |c| c.src == src)
    }

    /// Number of connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Build a trial graph of all existing edges plus the candidate and check
    /// whether the candidate closes a loop
    fn would_create_cycle(
        &self,
        internal_edges: &[(PortId, PortId)],
        src: PortId,
        dest: PortId,
    ) -> bool {
        let mut graph: DiGraph<PortId, ()> = DiGraph::new();
        let mut nodes: HashMap<PortId, NodeIndex> = HashMap::new();

        let mut node_for = |graph: &mut DiGraph<PortId, ()>,
                            nodes: &mut HashMap<PortId, NodeIndex>,
                            id: PortId| {
            *nodes.entry(id).or_insert_with(|| graph.add_node(id))
        };

        for conn in &self.connections {
            let a = node_for(&mut graph, &mut nodes, conn.src);
            let b = node_for(&mut graph, &mut nodes, conn.dest);
            graph.add_edge(a, b, ());
        }
        for (from, to) in internal_edges {
            let a = node_for(&mut graph, &mut nodes, *from);
            let b = node_for(&mut graph, &mut nodes, *to);
            graph.add_edge(a, b, ());
        }

        let src_node = node_for(&mut graph, &mut nodes, src);
        let dest_node = node_for(&mut graph, &mut nodes, dest);

        // If dest already reaches src, adding src -> dest closes a cycle
        has_path_connecting(&graph, dest_node, src_node, None)
    }

    /// Write each destination port's resolved source list into the arena
    ///
    /// Called whenever the registry or the port set changes, so the audio
    /// thread reads only the cached lists.
    pub fn resolve_into_arena(&self, arena: &PortArena) {
        for id in arena.ids() {
            if let Some(port) = arena.get_mut(id) {
                port.srcs.clear();
            }
        }
        for conn in &self.connections {
            if let Some(dest) = arena.get_mut(conn.dest) {
                dest.srcs.push(ResolvedSource {
                    src: conn.src,
                    multiplier: conn.multiplier,
                    enabled: conn.enabled,
                });
            }
        }
    }
}

impl Default for PortConnections {
    fn default() -> Self {
        Self::new()
    }
}
