//! Fault injection for the SMTP session.
//!
//! Three triggers can be armed, each with an SMTP error code and a
//! probability. A session consults the matching trigger right after MAIL
//! FROM and RCPT TO parse, and right after an AUTH mechanism is accepted.
//! A firing trigger answers with the configured code instead of advancing
//! the transaction.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use arc_swap::ArcSwap;
use rand::rngs::OsRng;
use rand::Rng;
use regex::Regex;
use thiserror::Error;

static TRIGGER_SPEC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-zA-Z0-9]+):(\d\d\d):(\d+)$").unwrap());

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChaosError {
    #[error("error code must be between 400 and 599")]
    InvalidErrorCode,

    #[error("probability must be between 0 and 100")]
    InvalidProbability,

    #[error("unknown key {0}")]
    UnknownTrigger(String),

    #[error("invalid argument: {0}")]
    InvalidSpec(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Sender,
    Recipient,
    Authentication,
}

impl TriggerKind {
    /// Text used in the SMTP reply when the trigger fires.
    fn reply_label(self) -> &'static str {
        match self {
            TriggerKind::Sender => "sender",
            TriggerKind::Recipient => "recipient",
            TriggerKind::Authentication => "authentication",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Sender => write!(f, "Sender"),
            TriggerKind::Recipient => write!(f, "Recipient"),
            TriggerKind::Authentication => write!(f, "Authentication"),
        }
    }
}

impl FromStr for TriggerKind {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sender" => Ok(TriggerKind::Sender),
            "recipient" | "recipients" => Ok(TriggerKind::Recipient),
            "auth" | "authentication" => Ok(TriggerKind::Authentication),
            _ => Err(ChaosError::UnknownTrigger(s.to_lowercase())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub error_code: u16,
    pub probability: u8,
}

impl Trigger {
    pub fn new(error_code: u16, probability: u8) -> Result<Self, ChaosError> {
        if !(400..=599).contains(&error_code) {
            return Err(ChaosError::InvalidErrorCode);
        }
        if probability > 100 {
            return Err(ChaosError::InvalidProbability);
        }
        Ok(Self {
            error_code,
            probability,
        })
    }

    fn fire(&self) -> Option<u16> {
        if self.probability == 0 {
            return None;
        }
        // the draw is 0-99 and probability is 1-100, so strictly less than
        let draw: u8 = OsRng.gen_range(0..100);
        (draw < self.probability).then_some(self.error_code)
    }
}

/// The full trigger set. Zero error codes fall back to 451/451/535 when
/// applied through [`ChaosEngine::set_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triggers {
    pub sender: Trigger,
    pub recipient: Trigger,
    pub authentication: Trigger,
}

impl Default for Triggers {
    fn default() -> Self {
        Self {
            sender: Trigger {
                error_code: 451,
                probability: 0,
            },
            recipient: Trigger {
                error_code: 451,
                probability: 0,
            },
            authentication: Trigger {
                error_code: 535,
                probability: 0,
            },
        }
    }
}

impl Triggers {
    pub fn get(&self, kind: TriggerKind) -> Trigger {
        match kind {
            TriggerKind::Sender => self.sender,
            TriggerKind::Recipient => self.recipient,
            TriggerKind::Authentication => self.authentication,
        }
    }

    fn slot(&mut self, kind: TriggerKind) -> &mut Trigger {
        match kind {
            TriggerKind::Sender => &mut self.sender,
            TriggerKind::Recipient => &mut self.recipient,
            TriggerKind::Authentication => &mut self.authentication,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    enabled: bool,
    triggers: Triggers,
}

/// Shared between every session of a server and the administrative side
/// that reconfigures it. Readers take one snapshot per evaluation.
#[derive(Debug, Default)]
pub struct ChaosEngine {
    state: ArcSwap<Snapshot>,
}

impl ChaosEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.load().enabled
    }

    pub fn triggers(&self) -> Triggers {
        self.state.load().triggers
    }

    /// Evaluate one trigger. Returns the error code to answer with if it fires.
    pub fn trigger(&self, kind: TriggerKind) -> Option<u16> {
        let snapshot = self.state.load();
        if !snapshot.enabled {
            return None;
        }
        snapshot.triggers.get(kind).fire()
    }

    /// The reply a session sends when `kind` fires with `code`.
    pub fn reply(kind: TriggerKind, code: u16) -> String {
        format!("{} Chaos {} error", code, kind.reply_label())
    }

    pub fn set(
        &self,
        kind: TriggerKind,
        error_code: u16,
        probability: u8,
    ) -> Result<(), ChaosError> {
        let trigger = Trigger::new(error_code, probability)?;
        self.state.rcu(|current| {
            let mut next = Snapshot::clone(current);
            next.enabled = true;
            *next.triggers.slot(kind) = trigger;
            Arc::new(next)
        });
        Ok(())
    }

    pub fn set_by_name(&self, key: &str, error_code: u16, probability: u8) -> Result<(), ChaosError> {
        self.set(key.parse()?, error_code, probability)
    }

    /// Replace all three triggers at once. Nothing is applied unless every
    /// trigger validates.
    pub fn set_all(&self, mut triggers: Triggers) -> Result<(), ChaosError> {
        let defaults = Triggers::default();
        for kind in [
            TriggerKind::Sender,
            TriggerKind::Recipient,
            TriggerKind::Authentication,
        ] {
            let slot = triggers.slot(kind);
            if slot.error_code == 0 {
                slot.error_code = defaults.get(kind).error_code;
            }
            *slot = Trigger::new(slot.error_code, slot.probability)?;
        }
        self.state.store(Arc::new(Snapshot {
            enabled: true,
            triggers,
        }));
        Ok(())
    }

    /// Apply a comma separated list of `Key:Code:Probability` items, such as
    /// `Sender:451:10,Authentication:535:50`.
    pub fn apply_spec(&self, spec: &str) -> Result<(), ChaosError> {
        if spec.trim().is_empty() {
            return Ok(());
        }

        for part in spec.split(',') {
            let part = part.trim();
            let caps = TRIGGER_SPEC_RE
                .captures(part)
                .ok_or_else(|| ChaosError::InvalidSpec(part.to_string()))?;
            let error_code: u16 = caps[2]
                .parse()
                .map_err(|_| ChaosError::InvalidSpec(part.to_string()))?;
            let probability: u8 = caps[3]
                .parse()
                .map_err(|_| ChaosError::InvalidProbability)?;
            self.set_by_name(&caps[1], error_code, probability)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_engine_never_fires() {
        let engine = ChaosEngine::new();
        assert!(!engine.is_enabled());
        for _ in 0..50 {
            assert_eq!(engine.trigger(TriggerKind::Sender), None);
        }
    }

    #[test]
    fn test_certain_trigger_always_fires() {
        let engine = ChaosEngine::new();
        engine.set(TriggerKind::Sender, 451, 100).unwrap();
        assert!(engine.is_enabled());
        for _ in 0..200 {
            assert_eq!(engine.trigger(TriggerKind::Sender), Some(451));
        }
        assert_eq!(engine.trigger(TriggerKind::Recipient), None);
    }

    #[test]
    fn test_zero_probability_never_fires() {
        let engine = ChaosEngine::new();
        engine.set(TriggerKind::Recipient, 452, 0).unwrap();
        assert!(engine.is_enabled());
        for _ in 0..200 {
            assert_eq!(engine.trigger(TriggerKind::Recipient), None);
        }
    }

    #[test]
    fn test_validation() {
        let engine = ChaosEngine::new();
        assert_eq!(
            engine.set(TriggerKind::Sender, 399, 10),
            Err(ChaosError::InvalidErrorCode)
        );
        assert_eq!(
            engine.set(TriggerKind::Sender, 600, 10),
            Err(ChaosError::InvalidErrorCode)
        );
        assert_eq!(
            engine.set(TriggerKind::Sender, 451, 101),
            Err(ChaosError::InvalidProbability)
        );
        // rejected settings do not arm the engine
        assert!(!engine.is_enabled());
    }

    #[test]
    fn test_key_aliases() {
        assert_eq!("Sender".parse(), Ok(TriggerKind::Sender));
        assert_eq!("RECIPIENTS".parse(), Ok(TriggerKind::Recipient));
        assert_eq!("auth".parse(), Ok(TriggerKind::Authentication));
        assert_eq!(
            "bounce".parse::<TriggerKind>(),
            Err(ChaosError::UnknownTrigger("bounce".to_string()))
        );
    }

    #[test]
    fn test_apply_spec() {
        let engine = ChaosEngine::new();
        engine
            .apply_spec("Sender:421:10, recipient:550:100,Authentication:535:0")
            .unwrap();
        let triggers = engine.triggers();
        assert_eq!(triggers.sender, Trigger::new(421, 10).unwrap());
        assert_eq!(triggers.recipient, Trigger::new(550, 100).unwrap());
        assert_eq!(triggers.authentication.probability, 0);

        assert_eq!(
            engine.apply_spec("Sender:4511:10"),
            Err(ChaosError::InvalidSpec("Sender:4511:10".to_string()))
        );
        assert_eq!(
            engine.apply_spec("Sender:451:300"),
            Err(ChaosError::InvalidProbability)
        );
        assert!(engine.apply_spec("").is_ok());
    }

    #[test]
    fn test_set_all_defaults_codes() {
        let engine = ChaosEngine::new();
        let mut triggers = Triggers::default();
        triggers.sender = Trigger {
            error_code: 0,
            probability: 5,
        };
        triggers.authentication = Trigger {
            error_code: 0,
            probability: 7,
        };
        engine.set_all(triggers).unwrap();

        let applied = engine.triggers();
        assert_eq!(applied.sender, Trigger::new(451, 5).unwrap());
        assert_eq!(applied.authentication, Trigger::new(535, 7).unwrap());
    }

    #[test]
    fn test_reply_text() {
        assert_eq!(
            ChaosEngine::reply(TriggerKind::Sender, 451),
            "451 Chaos sender error"
        );
        assert_eq!(
            ChaosEngine::reply(TriggerKind::Authentication, 535),
            "535 Chaos authentication error"
        );
    }
}
