pub mod clock;
pub mod codec;
pub mod constants;
pub mod error;
pub mod keys;
pub mod options;
pub mod settings;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{BincodeCodec, JsonCodec, SessionCodec};
pub use constants::*;
pub use error::{StartError, TrackerError};
pub use keys::KeyNamer;
pub use options::SessionEntryOptions;
pub use settings::{EffectivePolicy, TrackerSettings, TypePolicy};
pub use types::{LockStatus, Session, SessionKey, SessionType};
