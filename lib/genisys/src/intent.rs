use crate::shared::StationAddress;
use std::fmt;

/// Discrete actions the reducer can request from the executor.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IntentKind {
    SuspendAll,
    BeginInitialization,
    SendRecall,
    SendControls,
    PollNext,
    RetryCurrent,
    ScheduleControlDelivery,
}

impl IntentKind {
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            IntentKind::SuspendAll => "suspend_all",
            IntentKind::BeginInitialization => "begin_initialization",
            IntentKind::SendRecall => "send_recall",
            IntentKind::SendControls => "send_controls",
            IntentKind::PollNext => "poll_next",
            IntentKind::RetryCurrent => "retry_current",
            IntentKind::ScheduleControlDelivery => "schedule_control_delivery",
        }
    }
}

/// Intent set produced by one reducer step: a set of kinds plus an optional
/// target station. Dominant kinds (`SuspendAll`, `BeginInitialization`) are
/// always produced alone.
#[derive(Debug, Clone, PartialEq)]
pub struct Intents {
    kinds: Vec<IntentKind>,
    target: Option<StationAddress>,
}

impl Intents {
    #[inline]
    pub fn none() -> Intents {
        Intents {
            kinds: Vec::new(),
            target: None,
        }
    }

    /// A single untargeted intent.
    #[inline]
    pub fn global(kind: IntentKind) -> Intents {
        Intents {
            kinds: vec![kind],
            target: None,
        }
    }

    /// A single intent aimed at one station.
    #[inline]
    pub fn targeted(kind: IntentKind, station: StationAddress) -> Intents {
        Intents {
            kinds: vec![kind],
            target: Some(station),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    #[inline]
    pub fn contains(&self, kind: IntentKind) -> bool {
        self.kinds.contains(&kind)
    }

    #[inline]
    pub fn kinds(&self) -> &[IntentKind] {
        &self.kinds
    }

    #[inline]
    pub fn target(&self) -> Option<StationAddress> {
        self.target
    }

    /// The target, for intents that cannot exist without one. Absence is a
    /// programmer error in the reducer.
    #[inline]
    pub fn require_target(&self, kind: IntentKind) -> StationAddress {
        match self.target {
            Some(station) => station,
            None => panic!("{} intent produced without a target station", kind.name()),
        }
    }
}

impl fmt::Display for Intents {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;

        for kind in &self.kinds {
            if !first {
                write!(f, "+")?;
            }
            write!(f, "{}", kind.name())?;
            first = false;
        }

        if first {
            write!(f, "none")?;
        }

        if let Some(station) = self.target {
            write!(f, "@{}", station)?;
        }

        Ok(())
    }
}
