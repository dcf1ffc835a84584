pub mod clock;
pub mod error;
pub mod ids;
pub mod kinds;
pub mod types;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{KernelError, Result};
pub use ids::{IdAllocator, SequentialAllocator, UuidAllocator};
pub use kinds::{KindRegistry, KindSpec};
pub use serde_json::Value;
pub use types::{Attributes, Entity, EntityRef, ExecutionOutcome, Relations};
