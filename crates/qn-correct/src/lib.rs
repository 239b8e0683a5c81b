//! # qn-correct
//!
//! Q-vector construction and calibrated acceptance corrections.
//!
//! A [`Manager`] owns detectors; each [`Detector`] feeds one or more
//! [`DetectorConfiguration`]s that buffer the event's contributions, build a
//! [`QnVector`] and run it through ordered correction chains:
//!
//! - input-data corrections (channels configurations): gain equalization
//! - Q-vector corrections: recentering (`DDDD`), alignment (`EEEE`),
//!   twist and rescale (`FFFF`)
//!
//! Each step calibrates first and applies once it finds calibration input
//! from a previous pass in the [`CalibrationStore`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod calibration;
pub mod config;
pub mod correction;
pub mod detector;
pub mod manager;
pub mod qvector;

pub use calibration::{ALL_PROCESSES, CalibrationInput, CalibrationStore};
pub use config::ManagerConfig;
pub use correction::{
    CorrectionChain, InputCorrection, InputCorrectionSettings, QnCorrection,
    QnCorrectionSettings, StepOutcome, StepQa, StepState,
};
pub use detector::{
    ChannelSetup, ConfigurationKind, DataVector, Detector, DetectorConfiguration, LATEST_STAGE,
    PLAIN_STAGE, RAW_STAGE,
};
pub use manager::{Manager, QaReport};
pub use qvector::{Normalization, QnVector, QnVectorBuild, QnVectorRecord};
