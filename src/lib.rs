pub mod ann;
pub mod cache;
pub mod candidate;
pub mod cli;
pub mod config;
pub mod embed;
pub mod error;
pub mod hamming;
pub mod index;
pub mod matcher;
pub mod normalize;
pub mod orb;
pub mod phash;
pub mod report;
pub mod shape;
pub mod utils;
pub mod verify;

pub use candidate::{CandidateSet, FeatureExtractor, QueryRecord};
pub use config::Opts;
pub use error::MatchError;
pub use matcher::{MatchResult, Matcher};
pub use verify::{MatchScore, ScoringConfig, Verifier};
