//! Tri-state signal model shared by controls (master to slave) and
//! indications (slave to master). The two spaces never mix: sets and catalog
//! entries are tagged with a zero-sized kind marker.

mod index;
mod packed;
mod set;

pub use self::index::{DuplicateSignal, SignalId, SignalIndex};
pub use self::packed::{packed_len, PackedControlCodec, PackedIndicationDecoder};
pub use self::set::{MaterializeError, SignalSet, SignalValue};

/// Marker for the control signal space.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Control {}

/// Marker for the indication signal space.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Indication {}

pub type ControlId = SignalId<Control>;
pub type IndicationId = SignalId<Indication>;
pub type ControlIndex = SignalIndex<Control>;
pub type IndicationIndex = SignalIndex<Indication>;
pub type ControlSet = SignalSet<Control>;
pub type IndicationSet = SignalSet<Indication>;
