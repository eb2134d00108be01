use std::fmt;
use std::io;
use std::str::FromStr;

use crate::events::now_utc_iso;
use crate::signals::{SignalChannel, SignalKey, SignalKind, SignalPayload};

/// Position in the three-stage remesh ring. `Three` applies nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RemeshStage {
    #[default]
    One,
    Two,
    Three,
}

impl RemeshStage {
    pub fn number(&self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }

    pub fn from_number(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            3 => Some(Self::Three),
            _ => None,
        }
    }

    pub fn next(&self) -> Self {
        match self {
            Self::One => Self::Two,
            Self::Two => Self::Three,
            Self::Three => Self::One,
        }
    }

    /// Octree depth for the remesh operator; `None` on the pass-through stage.
    pub fn octree_depth(&self) -> Option<u8> {
        match self {
            Self::One => Some(5),
            Self::Two => Some(7),
            Self::Three => None,
        }
    }
}

impl fmt::Display for RemeshStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RemeshMode {
    Blocks,
    #[default]
    Smooth,
    Sharp,
}

impl RemeshMode {
    pub const ALL: [RemeshMode; 3] = [RemeshMode::Blocks, RemeshMode::Smooth, RemeshMode::Sharp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocks => "BLOCKS",
            Self::Smooth => "SMOOTH",
            Self::Sharp => "SHARP",
        }
    }
}

impl fmt::Display for RemeshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemeshMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BLOCKS" => Ok(Self::Blocks),
            "SMOOTH" => Ok(Self::Smooth),
            "SHARP" => Ok(Self::Sharp),
            other => Err(format!(
                "unknown remesh mode '{other}' (expected blocks, smooth or sharp)"
            )),
        }
    }
}

/// Remesh settings shared through the `remesh_state` file. The overlay sets
/// `enabled` and `mode`; the host advances `stage` after each import.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemeshCycleState {
    pub enabled: bool,
    pub stage: RemeshStage,
    pub mode: RemeshMode,
    pub updated_at: Option<String>,
}

impl RemeshCycleState {
    /// Reads the state file. A missing file, or any key that is missing or
    /// unreadable, falls back to the default for that key.
    pub fn load(channel: &SignalChannel) -> io::Result<Self> {
        let payload = channel.read_state(SignalKind::RemeshState)?;
        Ok(payload
            .map(|payload| Self::from_payload(&payload))
            .unwrap_or_default())
    }

    pub fn store(&mut self, channel: &SignalChannel) -> io::Result<()> {
        self.updated_at = Some(now_utc_iso());
        channel.write_state(SignalKind::RemeshState, &self.to_payload())
    }

    pub fn from_payload(payload: &SignalPayload) -> Self {
        let defaults = Self::default();
        Self {
            enabled: payload
                .get_bool(SignalKey::Enabled)
                .unwrap_or(defaults.enabled),
            stage: payload
                .get_u32(SignalKey::Stage)
                .and_then(RemeshStage::from_number)
                .unwrap_or(defaults.stage),
            mode: payload
                .get(SignalKey::Type)
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.mode),
            updated_at: payload.get(SignalKey::Timestamp).map(str::to_string),
        }
    }

    pub fn to_payload(&self) -> SignalPayload {
        let mut payload = SignalPayload::new()
            .with(SignalKey::Enabled, self.enabled.to_string())
            .with(SignalKey::Stage, self.stage.number().to_string())
            .with(SignalKey::Type, self.mode.as_str());
        if let Some(ts) = &self.updated_at {
            payload.set(SignalKey::Timestamp, ts);
        }
        payload
    }

    /// Whether the next import should run the remesh operator.
    pub fn applies_remesh(&self) -> bool {
        self.enabled && self.stage != RemeshStage::Three
    }

    pub fn advance(&mut self) {
        self.stage = self.stage.next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ring_wraps_after_three() {
        let mut stage = RemeshStage::One;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(stage.number());
            stage = stage.next();
        }
        assert_eq!(seen, vec![1, 2, 3, 1]);
        assert_eq!(RemeshStage::Three.octree_depth(), None);
        assert!(RemeshStage::One.octree_depth() < RemeshStage::Two.octree_depth());
    }

    #[test]
    fn missing_file_loads_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let state = RemeshCycleState::load(&SignalChannel::new(temp.path()))?;
        assert_eq!(state, RemeshCycleState::default());
        assert!(!state.applies_remesh());
        Ok(())
    }

    #[test]
    fn store_then_load_keeps_settings() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let channel = SignalChannel::new(temp.path());
        let mut state = RemeshCycleState {
            enabled: true,
            stage: RemeshStage::Two,
            mode: RemeshMode::Sharp,
            updated_at: None,
        };
        state.store(&channel)?;

        let loaded = RemeshCycleState::load(&channel)?;
        assert_eq!(loaded, state);
        assert!(loaded.updated_at.is_some());
        Ok(())
    }

    #[test]
    fn partial_legacy_file_defaults_missing_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        std::fs::write(
            temp.path().join("remesh_state"),
            "enabled=true\nstage=9\ntimestamp=2024-01-01 10:00:00\n",
        )?;
        let state = RemeshCycleState::load(&SignalChannel::new(temp.path()))?;
        assert!(state.enabled);
        assert_eq!(state.stage, RemeshStage::One);
        assert_eq!(state.mode, RemeshMode::Smooth);
        assert_eq!(state.updated_at.as_deref(), Some("2024-01-01 10:00:00"));
        Ok(())
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("blocks".parse::<RemeshMode>(), Ok(RemeshMode::Blocks));
        assert!("voxel".parse::<RemeshMode>().is_err());
    }
}
