#![forbid(unsafe_code)]

//! # mecombo
//!
//! Generates every plausible pairing of electrical cell models ("e-models") with
//! reconstructed morphologies, scores each pairing through an external simulator,
//! and keeps the pairings whose scores stay close enough to the e-model's exemplar.
//!
//! The workflow has three phases sharing one SQLite store:
//!
//! - **prepare**: join the recipe, morphology database and e-model/e-type map into a
//!   combination table ([`combo`]) and persist it ([`store`]);
//! - **run**: score every pending combination, one isolated process per task
//!   ([`execute`]);
//! - **select**: apply MEGate thresholds per e-model and write the accepted
//!   combinations ([`megate`]).

pub mod combo;
pub mod config;
pub mod emodels;
pub mod execute;
mod loose;
pub mod megate;
pub mod morphdb;
pub mod pattern;
pub mod prepare;
pub mod recipe;
pub mod store;

pub use combo::{CombinationRow, CombinationTable, Uid};
pub use config::{MegateConfig, ProjectConfig};
pub use execute::{run_combos, ProcessScorer, RunOptions, RunSummary, ScoreOutcome, ScoreTask, Scorer};
pub use megate::{
    AcceptedCombo, CandidateEvaluation, Megate, SelectError, Selection, SelectionSummary,
};
pub use prepare::{prepare_combos, PrepareError, PrepareSummary};
pub use store::{ComboStore, FloatFormat, ScoreRecord, StoreError};
