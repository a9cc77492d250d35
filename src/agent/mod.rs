pub mod local;
pub mod remote;
pub mod traits;

pub use local::LocalAgent;
pub use remote::{RemoteCallError, RemoteRunner};
pub use traits::{AgentExecutor, ExecOptions};
