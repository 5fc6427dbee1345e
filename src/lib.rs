pub mod auth;
pub mod cancel;
pub mod config;
pub mod copy;
pub mod errors;
pub mod executor;
pub mod handler;
pub mod messages;
pub mod parameters;
pub mod query;
pub mod rows;
pub mod statements;
pub mod stream;

mod connect;

pub use config::{Autosave, ConnectOptions, Credentials, HostSpec, IdpIdentity, QueryMode, SslMode, TargetServerType};
pub use connect::{connect, connect_with_strategies};
pub use copy::{CopyKind, CopyOperation};
pub use errors::{Error, ServerError};
pub use executor::{Connection, Portal, QueryFlags, SessionProfile, TransactionState};
pub use handler::{CommandStatus, ResultCollector, ResultHandler, ResultRows};
pub use messages::Notification;
pub use query::{NativeQuery, ParameterList, SqlCommandType, Tuple};
pub use rows::RowRingBuffer;
