pub mod browser;
pub mod credential;
pub mod engine;
pub mod events;
pub mod flags;
pub mod rotation;
pub mod state;

pub use browser::{BrowserError, BrowserSession};
pub use credential::{CredentialStore, CredentialStoreError};
pub use engine::{ProxyCall, ProxyEngine, RelayHttpResponse, ResponseBody};
pub use events::{EventHub, ProxyEvent};
pub use flags::{FlagStore, RuntimeFlags};
pub use rotation::{RotationController, RotationSnapshot, SwitchOutcome};
pub use state::AppState;
