//! # qn-hist
//!
//! Event-class binned online statistics for Q-vector calibration.
//!
//! Every accumulator keeps, per addressable bin, a sum, a sum of squares and
//! an entry count. Reported contents and errors are only defined once a bin
//! has reached its validation threshold (default 2 entries); below it they
//! read as zero.
//!
//! Shapes:
//! - [`Profile`]: one value per event-class cell
//! - [`ChannelizedProfile`]: one value per cell and detector channel
//! - [`ChannelizedIngress`]: read-only channelized input with channel-group view
//! - [`ComponentsProfile`]: X/Y per cell and harmonic
//! - [`CorrelationProfile`]: XX/XY/YX/YY per cell and harmonic
//!
//! All of them persist through the same serde-able [`AccumulatorStorage`],
//! collected by name in an [`AccumulatorList`].

#![warn(missing_docs)]
#![warn(clippy::all)]

mod binned;
pub mod components;
pub mod ingress;
pub mod profile;
pub mod storage;

pub use components::{ComponentsProfile, CorrelationProfile};
pub use ingress::{ChannelGroups, ChannelizedIngress};
pub use profile::{ChannelMap, ChannelizedProfile, Profile};
pub use storage::{
    AccumulatorList, AccumulatorStorage, Component, ErrorMode, SlotScheme, StorageLayout,
};
