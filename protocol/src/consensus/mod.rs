//! # Consensus Interface
//!
//! The runtime does not order events itself — it drives an ordering engine
//! through the [`ConsensusCore`] contract and ships whatever the engine
//! decides. This module holds that contract, the event/block data model the
//! contract speaks, and [`InmemCore`], a deterministic in-process engine used
//! by devnets and the multi-node test harness.

mod core;
mod inmem;
mod types;

pub use self::core::{ConsensusCore, CoreError};
pub use self::inmem::InmemCore;
pub use self::types::{
    Block, BlockBody, BlockSignature, Event, EventId, EventIndex, KnownEvents, ParticipantId,
    Root, RoundInfo, WireEvent,
};
