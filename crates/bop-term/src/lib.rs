//! Publisher-side term buffers for BOP's messaging transport.
//!
//! A publication appends frames into three memory-mapped terms used as a ring.
//! The active term fills, the publication rotates to the next one, and the term
//! two behind is handed to a cleaner so it is zeroed before the ring comes back
//! around. Writers are gated by a flow-control limit published by the
//! receiver-tracking side and are never blocked: backpressure surfaces as
//! [`TermError::WouldBlock`].
//!
//! ```rust
//! use std::sync::Arc;
//! use bop_term::{AtomicPosition, ClientConductor, PublicationConfig};
//!
//! let conductor = ClientConductor::new(PublicationConfig {
//!     term_buffer_length: 64 * 1024,
//!     ..PublicationConfig::default()
//! })
//! .expect("conductor");
//! let limit = Arc::new(AtomicPosition::new(4096));
//! let publication = conductor
//!     .add_publication("ipc", 1, 1, limit.clone())
//!     .expect("publication");
//!
//! let position = publication.offer(b"hello").expect("offer");
//! assert_eq!(position, 64);
//!
//! limit.set_ordered(0);
//! assert!(publication.offer(b"blocked").unwrap_err().is_would_block());
//! publication.close();
//! ```

pub mod appender;
pub mod claim;
pub mod conductor;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod flow_control;
pub mod fs;
pub mod idle;
pub mod metrics;
pub mod position;
pub mod publication;
pub mod storage;
pub mod term_buffer;
pub mod test_support;

pub use appender::{AppendOutcome, ClaimOutcome, TermAppender};
pub use claim::BufferClaim;
pub use conductor::{CleanerHandle, ClientConductor};
pub use config::{PublicationConfig, RegistrationId};
pub use descriptor::{DATA_HEADER_LENGTH, FRAME_ALIGNMENT, TermStatus};
pub use error::{BackpressureKind, TermError, TermResult};
pub use flow_control::{AtomicPosition, PositionIndicator, UnboundedLimit};
pub use fs::{TERM_FILE_EXTENSION, TermLayout};
pub use idle::{
    BackoffIdleStrategy, BusySpinIdleStrategy, IdleStrategy, SleepingIdleStrategy,
    YieldingIdleStrategy,
};
pub use metrics::{PublicationMetrics, PublicationMetricsSnapshot};
pub use position::{
    TERM_COUNT, buffer_index, calculate_position, position_bits_to_shift, rotate_next,
    rotate_previous,
};
pub use publication::{Publication, PublicationKey, PublicationRegistry, RotationOutcome};
pub use storage::MappedRegion;
pub use term_buffer::{TermBuffer, TermBuffers};
