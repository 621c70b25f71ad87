pub mod commands;
pub mod config;
pub mod template;

use clap::{Parser, Subcommand};

pub use commands::execute_command;

#[derive(Parser, Debug)]
#[command(name = "router-tunnel")]
#[command(author, version, about = "SSH diagnostic endpoint and reverse tunnel for remote routers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，RUST_LOG 优先
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行 SSH 服务端（以及按配置启用的反向隧道）
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "router.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成示例配置
    Template {
        /// 输出文件路径（默认打印到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
}
