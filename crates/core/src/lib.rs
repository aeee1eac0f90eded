//! # stanh-core — The Mathematical Engine
//!
//! Compute primitives for multi-rate learned image compression:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`quantize`] | `HardnessCell`, STanH surrogate, noise proxy, STE rounding |
//! | [`model`] | `CompressionModel` contract, `ReferenceCodec` |
//! | [`state`] | partial state-dict merge with a load report |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`.
//! 2. **No hidden globals.** Quantiser hardness lives in shared cells handed
//!    out by the model, never in process-wide statics.
//! 3. **Deterministic.** Same inputs + same hardness + same noise seed = same output.

pub mod model;
pub mod quantize;
pub mod state;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use model::{CodecOptions, CompressionModel, ModelOutput, Quantize, ReferenceCodec, StanhOptions};
pub use quantize::{level_range, noise_quantize, stanh, ste_round, HardnessCell};
pub use state::{merge_state_dict, LoadReport};
