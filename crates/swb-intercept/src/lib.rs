//! swb Interception Layer
//!
//! Decides, for every request the embedding browsing surface makes,
//! whether to pass it through, block it, or fetch it over the
//! controlled DoH path and substitute the result.
//!
//! Architecture:
//! 1. Request descriptor → classifier (verification, allow-list, media,
//!    ad rules in fixed order)
//! 2. Direct-fetch dispositions go through `swb-network`'s client
//! 3. Plain http links are pre-resolved through their redirect chain
//! 4. Transport failures feed rate-limited recovery

mod classifier;
mod engine;
mod patterns;
mod recovery;
mod redirect;

pub use classifier::{Classifier, Disposition, ResourceRequest};
pub use engine::{InterceptEngine, SubstituteResponse, ensure_safe_search, unwrap_amp};
pub use recovery::{
    ErrorRecovery, FallbackWindows, RecoveryAction, RecoveryConfig, TransportError,
};
pub use redirect::{RedirectResolver, should_resolve};
