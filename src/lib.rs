/// Router Tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod io_util;
pub mod relay;
pub mod sshd;
pub mod tunnel;

// 重新导出常用类型
pub use app::App;
pub use config::AppConfig;
pub use error::{Result, TunnelError};
pub use identity::{load_identity, load_trust_anchor, Identity};
pub use io_util::{is_expected_teardown, CancelReader};
pub use relay::RelayMode;
pub use sshd::{Authenticator, Credential, SshServer, SshServerConfig};
pub use tunnel::{ReconnectPolicy, TunnelOptions, TunnelSummary};
