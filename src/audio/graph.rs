use crate::audio::engine::EngineState;
use crate::audio::fader::{FaderGate, PanAlgorithm, PanLaw};
use crate::audio::plugin::{PluginIo, PluginSlot, PluginSlotKey, PluginTimeInfo};
use crate::audio::port::{PortFlow, PortId, PortType, RtCell};
use crate::audio::track::TrackId;
use crossbeam_channel::{Receiver, Sender};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Sample-accurate window handed to every node in a sub-cycle
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeInfo {
    /// Playhead frame at the start of the full cycle
    pub g_start_frame: i64,
    /// `g_start_frame` plus the sub-cycle offset
    pub g_start_w_offset: i64,
    /// Offset of this sub-cycle within the backend buffer
    pub local_offset: u32,
    /// Frames in this sub-cycle
    pub nframes: u32,
}

/// Everything a node needs to process one sub-cycle
#[derive(Debug, Clone, Copy)]
pub struct CycleCtx {
    pub time: TimeInfo,
    /// Whether the playhead advances over this window
    pub rolling: bool,
    /// Denormal prevention value for this cycle (±1e-20, alternating)
    pub denormal: f32,
    /// Latency pre-roll still to consume; routes below it run no-roll
    pub remaining_latency_preroll: u32,
    pub sample_rate: u32,
    pub bpm: f32,
    pub frames_per_tick: f64,
    pub recording: bool,
    pub punch_enabled: bool,
    pub punch_start: i64,
    pub punch_end: i64,
    pub any_soloed: bool,
    pub pan_law: PanLaw,
    pub pan_algorithm: PanAlgorithm,
    /// Gain applied to listened tracks routed into the monitor bus
    pub listen_dim: f32,
    /// Monitor fade ramp (start gain, per-frame step) around pause/resume
    pub monitor_fade: Option<(f32, f32)>,
}

impl CycleCtx {
    #[cfg(test)]
    pub fn test_default() -> Self {
        Self {
            time: TimeInfo::default(),
            rolling: false,
            denormal: 1e-20,
            remaining_latency_preroll: 0,
            sample_rate: 44100,
            bpm: 120.0,
            frames_per_tick: 22050.0 / 960.0,
            recording: false,
            punch_enabled: false,
            punch_start: 0,
            punch_end: 0,
            any_soloed: false,
            pan_law: PanLaw::Minus3Db,
            pan_algorithm: PanAlgorithm::SineLaw,
            listen_dim: 0.5,
            monitor_fade: None,
        }
    }
}

/// A processable unit in the routing graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// An input port that sums its sources
    Port(PortId),
    TrackProcessor(TrackId),
    Plugin(TrackId, PluginSlotKey),
    Prefader(TrackId),
    Fader(TrackId),
    ChannelSend(TrackId, u8),
    SampleProcessor,
    MonitorFader,
}

/// Scheduler node: successors, refcount and route latency
pub struct GraphNode {
    pub kind: NodeKind,
    pub succs: Vec<usize>,
    pub init_refcount: u32,
    pub refcount: AtomicU32,
    /// This node's own processing latency (plugins only)
    pub own_latency: u32,
    /// Max latency accumulated along any path into this node, plus own
    pub route_playback_latency: u32,
}

enum Trigger {
    Node(usize),
    Exit,
}

/// Shared core the audio thread and the workers both drive
pub struct RouterCore {
    /// Rebuilt only while no cycle is running and the workers are parked
    nodes: RtCell<Vec<GraphNode>>,
    ctx: RtCell<CycleCtx>,
    trigger_tx: Sender<Trigger>,
    trigger_rx: Receiver<Trigger>,
    completed: AtomicUsize,
    state: Arc<EngineState>,
}

impl RouterCore {
    fn process_one(&self, idx: usize) {
        // SAFETY-adjacent discipline: nodes and ctx are only replaced while
        // the graph is idle; during a cycle they are read-only shared state
        let nodes = self.nodes.get();
        let ctx = self.ctx.get();
        let node = &nodes[idx];

        process_node(&self.state, node, ctx);

        for &succ in &node.succs {
            if nodes[succ].refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _ = self.trigger_tx.send(Trigger::Node(succ));
            }
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
    }
}

/// The routing graph scheduler
///
/// Owns a worker-thread pool; each cycle the trigger nodes are pushed onto a
/// lock-free queue, workers (and the audio thread itself) pop and run nodes,
/// decrementing successors' refcounts until the whole graph has run.
pub struct Router {
    core: Arc<RouterCore>,
    workers: Vec<JoinHandle<()>>,
    /// Raised while the UI thread swaps graph topology; the audio callback
    /// outputs silence when it observes this
    pub setup_in_progress: Arc<AtomicBool>,
}

impl Router {
    /// Create the router and spawn its worker pool
    pub fn new(state: Arc<EngineState>, num_workers: usize) -> Self {
        let (trigger_tx, trigger_rx) = crossbeam_channel::unbounded();
        let core = Arc::new(RouterCore {
            nodes: RtCell::new(Vec::new()),
            ctx: RtCell::new(CycleCtx {
                time: TimeInfo::default(),
                rolling: false,
                denormal: 1e-20,
                remaining_latency_preroll: 0,
                sample_rate: 44100,
                bpm: 120.0,
                frames_per_tick: 22050.0 / 960.0,
                recording: false,
                punch_enabled: false,
                punch_start: 0,
                punch_end: 0,
                any_soloed: false,
                pan_law: PanLaw::Minus3Db,
                pan_algorithm: PanAlgorithm::SineLaw,
                listen_dim: 0.5,
                monitor_fade: None,
            }),
            trigger_tx,
            trigger_rx,
            completed: AtomicUsize::new(0),
            state,
        });

        let mut workers = Vec::new();
        for i in 0..num_workers {
            let core = Arc::clone(&core);
            let handle = std::thread::Builder::new()
                .name(format!("graph-worker-{}", i))
                .spawn(move || loop {
                    match core.trigger_rx.recv() {
                        Ok(Trigger::Node(idx)) => core.process_one(idx),
                        Ok(Trigger::Exit) | Err(_) => break,
                    }
                })
                .expect("failed to spawn graph worker");
            workers.push(handle);
        }

        Self {
            core,
            workers,
            setup_in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of nodes in the compiled graph
    pub fn node_count(&self) -> usize {
        self.core.nodes.get().len()
    }

    /// Total playback latency of the longest route (for latency pre-roll)
    pub fn max_route_latency(&self) -> u32 {
        self.core
            .nodes
            .get()
            .iter()
            .map(|n| n.route_playback_latency)
            .max()
            .unwrap_or(0)
    }

    /// Recompile the graph from the current project structure
    ///
    /// Must only be called while no cycle is running (the engine pauses or
    /// holds the cycle off via `setup_in_progress`).
    pub fn rebuild(&self) {
        self.setup_in_progress.store(true, Ordering::SeqCst);
        let nodes = build_nodes(&self.core.state);
        log::debug!("router: rebuilt graph with {} nodes", nodes.len());
        *self.core.nodes.get_mut() = nodes;
        self.setup_in_progress.store(false, Ordering::SeqCst);
    }

    /// Run the whole graph for one sub-cycle
    ///
    /// The calling (audio) thread participates in the wave-front so a
    /// zero-worker router still completes; its only wait is a bounded spin.
    pub fn run_cycle(&self, ctx: CycleCtx) {
        let core = &self.core;
        *core.ctx.get_mut() = ctx;

        let nodes = core.nodes.get();
        let total = nodes.len();
        if total == 0 {
            return;
        }
        core.completed.store(0, Ordering::SeqCst);
        for node in nodes.iter() {
            node.refcount.store(node.init_refcount, Ordering::Relaxed);
        }
        for (idx, node) in nodes.iter().enumerate() {
            if node.init_refcount == 0 {
                let _ = core.trigger_tx.send(Trigger::Node(idx));
            }
        }

        while core.completed.load(Ordering::Acquire) < total {
            match core.trigger_rx.try_recv() {
                Ok(Trigger::Node(idx)) => core.process_one(idx),
                Ok(Trigger::Exit) => break,
                Err(_) => std::hint::spin_loop(),
            }
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.core.trigger_tx.send(Trigger::Exit);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Module-internal input -> output flow, used by connection validation so
/// feedback through a chain of modules is rejected as a cycle
pub fn collect_internal_edges(state: &EngineState) -> Vec<(PortId, PortId)> {
    let mut edges = Vec::new();
    let tracklist = state.tracklist.get();

    let stereo_pair = |edges: &mut Vec<(PortId, PortId)>,
                           ins: Option<crate::audio::port::StereoPorts>,
                           outs: Option<crate::audio::port::StereoPorts>| {
        if let (Some(i), Some(o)) = (ins, outs) {
            edges.push((i.l, o.l));
            edges.push((i.r, o.r));
        }
    };

    for track in tracklist.iter() {
        let tp = &track.processor;
        stereo_pair(&mut edges, tp.stereo_in, tp.stereo_out);
        if let (Some(i), Some(o)) = (tp.midi_in, tp.midi_out) {
            edges.push((i, o));
        }
        if let Some(channel) = &track.channel {
            for slot in channel.slots() {
                stereo_pair(&mut edges, slot.audio_in, slot.audio_out);
                if let (Some(i), Some(o)) = (slot.midi_in, slot.midi_out) {
                    edges.push((i, o));
                }
                if let (Some(i), Some(o)) = (slot.midi_in, slot.audio_out) {
                    edges.push((i, o.l));
                }
            }
            for fader in [&channel.prefader, &channel.fader] {
                stereo_pair(&mut edges, Some(fader.stereo_in), Some(fader.stereo_out));
            }
            for send in &channel.sends {
                stereo_pair(&mut edges, Some(send.stereo_in), Some(send.stereo_out));
            }
        }
    }
    {
        let control_room = state.control_room.get();
        stereo_pair(
            &mut edges,
            Some(control_room.monitor_fader.stereo_in),
            Some(control_room.monitor_fader.stereo_out),
        );
    }
    edges
}

/// Compile the project into scheduler nodes
///
/// One node per processable unit; port nodes are created for input ports
/// that have resolved sources. Edges run source-module -> input-port ->
/// consuming-module. Latencies accumulate along edges in topological order.
fn build_nodes(state: &EngineState) -> Vec<GraphNode> {
    let arena = state.ports.get();
    let tracklist = state.tracklist.get();
    let control_room = state.control_room.get();
    let sample_processor = state.sample_processor.get();

    let mut graph: DiGraph<NodeKind, ()> = DiGraph::new();
    let mut module_of_output: HashMap<PortId, NodeIndex> = HashMap::new();
    let mut module_of_input: HashMap<PortId, NodeIndex> = HashMap::new();

    let register = |graph: &mut DiGraph<NodeKind, ()>,
                        module_of_output: &mut HashMap<PortId, NodeIndex>,
                        module_of_input: &mut HashMap<PortId, NodeIndex>,
                        kind: NodeKind,
                        inputs: Vec<PortId>,
                        outputs: Vec<PortId>| {
        let node = graph.add_node(kind);
        for port in inputs {
            module_of_input.insert(port, node);
        }
        for port in outputs {
            module_of_output.insert(port, node);
        }
        node
    };

    for track in tracklist.iter() {
        let tp = &track.processor;
        let mut tp_in = Vec::new();
        let mut tp_out = Vec::new();
        if let Some(sp) = tp.stereo_in {
            tp_in.extend([sp.l, sp.r]);
        }
        if let Some(p) = tp.midi_in {
            tp_in.push(p);
        }
        if let Some(sp) = tp.stereo_out {
            tp_out.extend([sp.l, sp.r]);
        }
        if let Some(p) = tp.midi_out {
            tp_out.push(p);
        }
        register(
            &mut graph,
            &mut module_of_output,
            &mut module_of_input,
            NodeKind::TrackProcessor(track.id),
            tp_in,
            tp_out,
        );

        if let Some(channel) = &track.channel {
            for slot in channel.slots() {
                if slot.failed {
                    continue;
                }
                let mut ins = vec![slot.enabled_port];
                ins.extend(&slot.param_ports);
                let mut outs = Vec::new();
                if let Some(sp) = slot.audio_in {
                    ins.extend([sp.l, sp.r]);
                }
                if let Some(sp) = slot.audio_out {
                    outs.extend([sp.l, sp.r]);
                }
                if let Some(p) = slot.midi_in {
                    ins.push(p);
                }
                if let Some(p) = slot.midi_out {
                    outs.push(p);
                }
                register(
                    &mut graph,
                    &mut module_of_output,
                    &mut module_of_input,
                    NodeKind::Plugin(track.id, slot.key),
                    ins,
                    outs,
                );
            }

            for (fader, kind) in [
                (&channel.prefader, NodeKind::Prefader(track.id)),
                (&channel.fader, NodeKind::Fader(track.id)),
            ] {
                let mut ins = vec![
                    fader.stereo_in.l,
                    fader.stereo_in.r,
                    fader.amp_port,
                    fader.balance_port,
                    fader.mute_port,
                    fader.solo_port,
                    fader.listen_port,
                ];
                for p in [fader.input_gain_port, fader.output_gain_port, fader.mono_port]
                    .into_iter()
                    .flatten()
                {
                    ins.push(p);
                }
                register(
                    &mut graph,
                    &mut module_of_output,
                    &mut module_of_input,
                    kind,
                    ins,
                    vec![fader.stereo_out.l, fader.stereo_out.r],
                );
            }

            for send in &channel.sends {
                if send.is_empty() {
                    continue;
                }
                register(
                    &mut graph,
                    &mut module_of_output,
                    &mut module_of_input,
                    NodeKind::ChannelSend(track.id, send.index),
                    vec![
                        send.stereo_in.l,
                        send.stereo_in.r,
                        send.amount_port,
                        send.enabled_port,
                    ],
                    vec![send.stereo_out.l, send.stereo_out.r],
                );
            }
        }
    }

    register(
        &mut graph,
        &mut module_of_output,
        &mut module_of_input,
        NodeKind::SampleProcessor,
        Vec::new(),
        vec![
            sample_processor.stereo_out.l,
            sample_processor.stereo_out.r,
        ],
    );
    {
        let fader = &control_room.monitor_fader;
        let ins = vec![
            fader.stereo_in.l,
            fader.stereo_in.r,
            fader.amp_port,
            fader.balance_port,
            fader.mute_port,
            fader.solo_port,
            fader.listen_port,
        ];
        register(
            &mut graph,
            &mut module_of_output,
            &mut module_of_input,
            NodeKind::MonitorFader,
            ins,
            vec![fader.stereo_out.l, fader.stereo_out.r],
        );
    }

    // Port nodes for every input port with at least one resolved source,
    // wired source-module -> port -> consuming-module
    for id in arena.ids() {
        let Some(port) = arena.get(id) else {
            continue;
        };
        if port.flow != PortFlow::Input || port.srcs.is_empty() {
            continue;
        }
        let port_node = graph.add_node(NodeKind::Port(id));
        for src in &port.srcs {
            if let Some(&producer) = module_of_output.get(&src.src) {
                graph.update_edge(producer, port_node, ());
            }
        }
        if let Some(&consumer) = module_of_input.get(&id) {
            graph.update_edge(port_node, consumer, ());
        }
    }

    // Automation ordering: the processor applying a lane must run before the
    // module whose port it drives
    for track in tracklist.iter() {
        let tp_node = graph
            .node_indices()
            .find(|&n| graph[n] == NodeKind::TrackProcessor(track.id));
        let Some(tp_node) = tp_node else { continue };
        for at in track.automation.iter() {
            if let Some(&consumer) = module_of_input.get(&at.port) {
                if consumer != tp_node {
                    graph.update_edge(tp_node, consumer, ());
                }
            }
        }
    }

    // Flatten into scheduler nodes with dense indices
    let index_of: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .enumerate()
        .map(|(i, n)| (n, i))
        .collect();

    let mut nodes: Vec<GraphNode> = graph
        .node_indices()
        .map(|n| {
            let kind = graph[n];
            let own_latency = match kind {
                NodeKind::Plugin(track, key) => tracklist
                    .track(track)
                    .and_then(|t| t.channel.as_ref())
                    .and_then(|c| c.slot(key))
                    .map(|s| s.latency)
                    .unwrap_or(0),
                _ => 0,
            };
            let succs: Vec<usize> = graph
                .neighbors_directed(n, Direction::Outgoing)
                .map(|s| index_of[&s])
                .collect();
            let init_refcount = graph
                .neighbors_directed(n, Direction::Incoming)
                .count() as u32;
            GraphNode {
                kind,
                succs,
                init_refcount,
                refcount: AtomicU32::new(init_refcount),
                own_latency,
                route_playback_latency: own_latency,
            }
        })
        .collect();

    // Accumulate route latencies in topological order
    if let Ok(order) = petgraph::algo::toposort(&graph, None) {
        for n in order {
            let i = index_of[&n];
            let base = nodes[i].route_playback_latency;
            for s in nodes[i].succs.clone() {
                let candidate = base + nodes[s].own_latency;
                if candidate > nodes[s].route_playback_latency {
                    nodes[s].route_playback_latency = candidate;
                }
            }
        }
    } else {
        log::error!("router: project graph contains a cycle; latencies unset");
    }

    nodes
}

/// Whether a node runs silent during latency pre-roll
fn should_no_roll(node: &GraphNode, ctx: &CycleCtx) -> bool {
    ctx.remaining_latency_preroll > 0
        && node.route_playback_latency < ctx.remaining_latency_preroll
}

/// Execute one node for the current sub-cycle
fn process_node(state: &EngineState, node: &GraphNode, ctx: &CycleCtx) {
    let arena = state.ports.get();
    let no_roll = should_no_roll(node, ctx);

    match node.kind {
        NodeKind::Port(id) => {
            if let Some(port) = arena.get_mut(id) {
                let start = ctx.time.local_offset as usize;
                let end = start + ctx.time.nframes as usize;
                match port.port_type {
                    PortType::Audio | PortType::Cv => {
                        let len = port.buf.len();
                        for s in &mut port.buf[start..end.min(len)] {
                            *s = 0.0;
                        }
                    }
                    PortType::Midi => port.midi_events.clear(),
                    PortType::Control => {}
                }
                port.sum_inputs(
                    arena,
                    ctx.time.local_offset,
                    ctx.time.nframes,
                    no_roll,
                    ctx.denormal,
                );
            }
        }
        NodeKind::TrackProcessor(id) => {
            let tracklist = state.tracklist.get();
            if let Some(track) = tracklist.track(id) {
                track.processor.process(track, arena, ctx, no_roll);
            }
        }
        NodeKind::Plugin(id, key) => {
            let tracklist = state.tracklist.get();
            let slot = tracklist
                .track(id)
                .and_then(|t| t.channel.as_ref())
                .and_then(|c| c.slot(key));
            if let Some(slot) = slot {
                process_plugin_slot(state, slot, ctx, no_roll);
            }
        }
        NodeKind::Prefader(id) | NodeKind::Fader(id) => {
            let tracklist = state.tracklist.get();
            let Some(track) = tracklist.track(id) else {
                return;
            };
            let Some(channel) = &track.channel else {
                return;
            };
            let fader = if matches!(node.kind, NodeKind::Prefader(_)) {
                &channel.prefader
            } else {
                &channel.fader
            };
            let gate = FaderGate {
                any_solo: ctx.any_soloed,
                soloed: tracklist.effectively_soloed(id, arena),
                muted: track.is_muted(arena),
                listened: track.is_listened(arena),
            };
            fader.process(arena, ctx.time.local_offset, ctx.time.nframes, gate, None);
        }
        NodeKind::ChannelSend(id, index) => {
            let tracklist = state.tracklist.get();
            let send = tracklist
                .track(id)
                .and_then(|t| t.channel.as_ref())
                .and_then(|c| c.sends.get(index as usize));
            if let Some(send) = send {
                send.process(arena, ctx.time.local_offset, ctx.time.nframes);
            }
        }
        NodeKind::SampleProcessor => {
            state
                .sample_processor
                .get_mut()
                .process(arena, ctx.time.local_offset, ctx.time.nframes);
        }
        NodeKind::MonitorFader => {
            let control_room = state.control_room.get();
            control_room.monitor_fader.process(
                arena,
                ctx.time.local_offset,
                ctx.time.nframes,
                FaderGate::default(),
                ctx.monitor_fade,
            );
        }
    }
}

/// Run one plugin slot: copy parameters, honor bypass, process in place
fn process_plugin_slot(state: &EngineState, slot: &PluginSlot, ctx: &CycleCtx, no_roll: bool) {
    let arena = state.ports.get();
    let start = ctx.time.local_offset as usize;
    let end = start + ctx.time.nframes as usize;

    let enabled = arena
        .get(slot.enabled_port)
        .map(|p| p.is_toggled())
        .unwrap_or(true);

    if no_roll {
        if let Some(out) = slot.audio_out {
            for id in [out.l, out.r] {
                if let Some(port) = arena.get_mut(id) {
                    let len = port.buf.len();
                    for s in &mut port.buf[start..end.min(len)] {
                        *s = ctx.denormal;
                    }
                }
            }
        }
        if let Some(mout) = slot.midi_out {
            if let Some(port) = arena.get_mut(mout) {
                port.midi_events.clear();
            }
        }
        return;
    }

    // Bypass: pass audio and MIDI straight through
    if !enabled {
        if let (Some(ain), Some(aout)) = (slot.audio_in, slot.audio_out) {
            for (i, o) in [(ain.l, aout.l), (ain.r, aout.r)] {
                if let (Some(src), Some(dest)) = (arena.get(i), arena.get_mut(o)) {
                    let n = end.min(src.buf.len()).min(dest.buf.len());
                    if start < n {
                        dest.buf[start..n].copy_from_slice(&src.buf[start..n]);
                    }
                }
            }
        }
        if let (Some(min), Some(mout)) = (slot.midi_in, slot.midi_out) {
            if let (Some(src), Some(dest)) = (arena.get(min), arena.get_mut(mout)) {
                dest.midi_events.clear();
                dest.midi_events.append(
                    &src.midi_events,
                    ctx.time.local_offset,
                    ctx.time.nframes,
                );
            }
        }
        return;
    }

    // Refresh the parameter scratch from the control ports
    let params = slot.param_scratch.get_mut();
    for (i, pid) in slot.param_ports.iter().enumerate() {
        if let Some(port) = arena.get(*pid) {
            params[i] = port.control;
        }
    }

    let window = |len: usize| {
        let n = end.min(len);
        (start.min(n), n)
    };
    let empty: &[f32] = &[];
    let in_l = slot
        .audio_in
        .and_then(|sp| arena.get(sp.l))
        .map(|p| {
            let (s, n) = window(p.buf.len());
            &p.buf[s..n]
        })
        .unwrap_or(empty);
    let in_r = slot
        .audio_in
        .and_then(|sp| arena.get(sp.r))
        .map(|p| {
            let (s, n) = window(p.buf.len());
            &p.buf[s..n]
        })
        .unwrap_or(empty);

    let mut empty_out_l: [f32; 0] = [];
    let mut empty_out_r: [f32; 0] = [];
    let (out_l, out_r): (&mut [f32], &mut [f32]) = match slot.audio_out {
        Some(sp) => {
            let l = arena.get_mut(sp.l).map(|p| {
                let (s, n) = window(p.buf.len());
                &mut p.buf[s..n]
            });
            let r = arena.get_mut(sp.r).map(|p| {
                let (s, n) = window(p.buf.len());
                &mut p.buf[s..n]
            });
            match (l, r) {
                (Some(l), Some(r)) => (l, r),
                _ => (&mut empty_out_l[..], &mut empty_out_r[..]),
            }
        }
        None => (&mut empty_out_l[..], &mut empty_out_r[..]),
    };

    let midi_in = slot
        .midi_in
        .and_then(|p| arena.get(p))
        .map(|p| p.midi_events.as_slice())
        .unwrap_or(&[]);

    let midi_out = match slot.midi_out.and_then(|p| arena.get_mut(p)) {
        Some(port) => {
            port.midi_events.clear();
            &mut port.midi_events
        }
        None => {
            let scratch = slot.midi_scratch.get_mut();
            scratch.clear();
            scratch
        }
    };

    let time = PluginTimeInfo {
        g_start_frame: ctx.time.g_start_w_offset,
        nframes: ctx.time.nframes,
        sample_rate: ctx.sample_rate,
        bpm: ctx.bpm,
        rolling: ctx.rolling,
    };
    let mut io = PluginIo {
        audio_in_l: in_l,
        audio_in_r: in_r,
        audio_out_l: out_l,
        audio_out_r: out_r,
        midi_in,
        midi_out,
        params: &params[..],
    };
    slot.instance.get_mut().process(&time, &mut io);
}

/// How many graph workers to spawn for this machine
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cores.saturating_sub(1).clamp(1, 4)
}
