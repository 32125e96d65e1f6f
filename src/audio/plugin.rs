use crate::audio::midi::{MidiEvent, MidiEvents};
use crate::audio::port::{PortId, RtCell, StereoPorts};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors from plugin hosting
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin instantiation failed: {0}")]
    InstantiationFailed(String),
    #[error("plugin state i/o failed: {0}")]
    StateIo(#[from] std::io::Error),
    #[error("plugin state is malformed: {0}")]
    StateFormat(String),
}

/// Position of a plugin within a channel strip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginSlotKey {
    MidiFx(u8),
    Instrument,
    Insert(u8),
}

/// Static description of a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    /// Stable identifier across the host format (URI, class id, ...)
    pub uid: String,
}

/// One automatable parameter exposed by a plugin
#[derive(Debug, Clone)]
pub struct PluginParam {
    pub id: u32,
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

impl PluginParam {
    pub fn new(id: u32, name: impl Into<String>, min: f32, max: f32, default: f32) -> Self {
        Self {
            id,
            name: name.into(),
            min,
            max,
            default,
        }
    }
}

/// Musical time handed to plugins each process call
#[derive(Debug, Clone, Copy)]
pub struct PluginTimeInfo {
    /// Global frame the window starts at
    pub g_start_frame: i64,
    /// Frames in this window
    pub nframes: u32,
    pub sample_rate: u32,
    pub bpm: f32,
    pub rolling: bool,
}

/// Buffer views a plugin processes in place
///
/// Unused halves are empty slices: a MIDI effect sees empty audio buffers, an
/// insert sees an empty MIDI list.
pub struct PluginIo<'a> {
    pub audio_in_l: &'a [f32],
    pub audio_in_r: &'a [f32],
    pub audio_out_l: &'a mut [f32],
    pub audio_out_r: &'a mut [f32],
    pub midi_in: &'a [MidiEvent],
    pub midi_out: &'a mut MidiEvents,
    /// Current parameter values, indexed like `params()`
    pub params: &'a [f32],
}

/// The capability surface every hosted plugin implements
///
/// Host-format adapters (LV2, CLAP, VST, ...) live outside the engine; the
/// engine only drives this contract.
pub trait Plugin: Send {
    /// Static descriptor
    fn descriptor(&self) -> &PluginDescriptor;

    /// Parameter list; the channel materializes one control port per entry
    fn params(&self) -> &[PluginParam];

    /// Processing latency in frames
    fn latency(&self) -> u32 {
        0
    }

    fn activate(&mut self) {}
    fn deactivate(&mut self) {}
    fn start_processing(&mut self) {}
    fn stop_processing(&mut self) {}

    /// Process one window; buffers are sized to the window
    fn process(&mut self, time: &PluginTimeInfo, io: &mut PluginIo);

    /// Persist internal state to a file
    fn save_state(&self, path: &Path) -> Result<(), PluginError>;

    /// Restore internal state from a file
    fn load_state(&mut self, path: &Path) -> Result<(), PluginError>;

    fn open_ui(&mut self) {}
    fn close_ui(&mut self) {}

    /// Set a parameter by id; `notify` asks the host to echo the change to
    /// attached UIs
    fn set_parameter(&mut self, id: u32, value: f32, notify: bool);
}

/// A plugin mounted in a channel slot, with its materialized ports
///
/// The instance sits in an `RtCell` because only this slot's graph node may
/// touch it during a cycle.
pub struct PluginSlot {
    pub key: PluginSlotKey,
    pub instance: RtCell<Box<dyn Plugin>>,
    /// Instantiation failed; the slot is skipped during processing
    pub failed: bool,

    /// Control port carrying the bypass toggle
    pub enabled_port: PortId,
    /// One control port per plugin parameter
    pub param_ports: Vec<PortId>,
    pub audio_in: Option<StereoPorts>,
    pub audio_out: Option<StereoPorts>,
    pub midi_in: Option<PortId>,
    pub midi_out: Option<PortId>,

    /// Scratch copy of parameter values passed into `process`
    pub param_scratch: RtCell<Vec<f32>>,
    /// Fallback event sink for slots without a MIDI output port
    pub midi_scratch: RtCell<MidiEvents>,
    /// Latency cached at graph rebuild
    pub latency: u32,
}

impl PluginSlot {
    /// All arena ports belonging to this slot
    pub fn all_ports(&self) -> Vec<PortId> {
        let mut ports = vec![self.enabled_port];
        ports.extend(&self.param_ports);
        if let Some(sp) = self.audio_in {
            ports.push(sp.l);
            ports.push(sp.r);
        }
        if let Some(sp) = self.audio_out {
            ports.push(sp.l);
            ports.push(sp.r);
        }
        if let Some(p) = self.midi_in {
            ports.push(p);
        }
        if let Some(p) = self.midi_out {
            ports.push(p);
        }
        ports
    }
}

/// Minimal gain plugin used for channel-strip testing and as the reference
/// implementation of the contract
pub struct GainPlugin {
    descriptor: PluginDescriptor,
    params: Vec<PluginParam>,
    gain: f32,
}

impl GainPlugin {
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor {
                name: "Gain".to_string(),
                uid: "builtin://gain".to_string(),
            },
            params: vec![PluginParam::new(0, "Gain", 0.0, 2.0, 1.0)],
            gain: 1.0,
        }
    }
}

impl Default for GainPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for GainPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn params(&self) -> &[PluginParam] {
        &self.params
    }

    fn process(&mut self, _time: &PluginTimeInfo, io: &mut PluginIo) {
        let gain = io.params.first().copied().unwrap_or(self.gain);
        self.gain = gain;
        for (out, inp) in io.audio_out_l.iter_mut().zip(io.audio_in_l.iter()) {
            *out = inp * gain;
        }
        for (out, inp) in io.audio_out_r.iter_mut().zip(io.audio_in_r.iter()) {
            *out = inp * gain;
        }
    }

    fn save_state(&self, path: &Path) -> Result<(), PluginError> {
        let json = serde_json::json!({ "gain": self.gain });
        std::fs::write(path, json.to_string())?;
        Ok(())
    }

    fn load_state(&mut self, path: &Path) -> Result<(), PluginError> {
        let text = std::fs::read_to_string(path)?;
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| PluginError::StateFormat(e.to_string()))?;
        self.gain = value
            .get("gain")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| PluginError::StateFormat("missing gain".to_string()))?
            as f32;
        Ok(())
    }

    fn set_parameter(&mut self, id: u32, value: f32, _notify: bool) {
        if id == 0 {
            self.gain = value.clamp(0.0, 2.0);
        }
    }
}

/// Passthrough plugin with an internal delay line, reporting its latency
///
/// Used to exercise the scheduler's latency pre-roll.
pub struct DelayLinePlugin {
    descriptor: PluginDescriptor,
    params: Vec<PluginParam>,
    delay_frames: u32,
    buf_l: Vec<f32>,
    buf_r: Vec<f32>,
    write_pos: usize,
}

impl DelayLinePlugin {
    pub fn new(delay_frames: u32) -> Self {
        Self {
            descriptor: PluginDescriptor {
                name: "Delay Line".to_string(),
                uid: "builtin://delay-line".to_string(),
            },
            params: Vec::new(),
            delay_frames,
            buf_l: vec![0.0; delay_frames as usize],
            buf_r: vec![0.0; delay_frames as usize],
            write_pos: 0,
        }
    }
}

impl Plugin for DelayLinePlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn params(&self) -> &[PluginParam] {
        &self.params
    }

    fn latency(&self) -> u32 {
        self.delay_frames
    }

    fn process(&mut self, _time: &PluginTimeInfo, io: &mut PluginIo) {
        if self.delay_frames == 0 {
            io.audio_out_l.copy_from_slice(io.audio_in_l);
            io.audio_out_r.copy_from_slice(io.audio_in_r);
            return;
        }
        let len = self.buf_l.len();
        for i in 0..io.audio_out_l.len() {
            let delayed_l = self.buf_l[self.write_pos];
            let delayed_r = self.buf_r[self.write_pos];
            self.buf_l[self.write_pos] = io.audio_in_l.get(i).copied().unwrap_or(0.0);
            self.buf_r[self.write_pos] = io.audio_in_r.get(i).copied().unwrap_or(0.0);
            self.write_pos = (self.write_pos + 1) % len;
            io.audio_out_l[i] = delayed_l;
            io.audio_out_r[i] = delayed_r;
        }
    }

    fn save_state(&self, path: &Path) -> Result<(), PluginError> {
        let json = serde_json::json!({ "delay_frames": self.delay_frames });
        std::fs::write(path, json.to_string())?;
        Ok(())
    }

    fn load_state(&mut self, _path: &Path) -> Result<(), PluginError> {
        Ok(())
    }

    fn set_parameter(&mut self, _id: u32, _value: f32, _notify: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_stereo(plugin: &mut dyn Plugin, input: &[f32], params: &[f32]) -> Vec<f32> {
        let mut out_l = vec![0.0; input.len()];
        let mut out_r = vec![0.0; input.len()];
        let mut midi_out = MidiEvents::new();
        let time = PluginTimeInfo {
            g_start_frame: 0,
            nframes: input.len() as u32,
            sample_rate: 44100,
            bpm: 120.0,
            rolling: true,
        };
        let mut io = PluginIo {
            audio_in_l: input,
            audio_in_r: input,
            audio_out_l: &mut out_l,
            audio_out_r: &mut out_r,
            midi_in: &[],
            midi_out: &mut midi_out,
            params,
        };
        plugin.process(&time, &mut io);
        out_l
    }

    #[test]
    fn test_gain_plugin_scales() {
        let mut plugin = GainPlugin::new();
        let out = run_stereo(&mut plugin, &[1.0, 0.5], &[0.5]);
        assert_eq!(out, vec![0.5, 0.25]);
    }

    #[test]
    fn test_gain_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gain.json");
        let mut plugin = GainPlugin::new();
        plugin.set_parameter(0, 1.5, false);
        plugin.save_state(&path).unwrap();

        let mut restored = GainPlugin::new();
        restored.load_state(&path).unwrap();
        let out = run_stereo(&mut restored, &[1.0], &[]);
        assert_eq!(out, vec![1.5]);
    }

    #[test]
    fn test_delay_line_latency() {
        let mut plugin = DelayLinePlugin::new(2);
        assert_eq!(plugin.latency(), 2);
        let out = run_stereo(&mut plugin, &[1.0, 2.0, 3.0, 4.0], &[]);
        assert_eq!(out, vec![0.0, 0.0, 1.0, 2.0]);
    }
}
