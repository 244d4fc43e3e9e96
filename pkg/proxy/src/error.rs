use pkg_types::endpoint::PortMapError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid endpoint spec: {0}")]
    InvalidSpec(String),
    #[error("invalid port map declaration: {0}")]
    PortMap(#[from] PortMapError),
    #[error("loading kernel module {module} failed: {message}")]
    ModuleLoad { module: String, message: String },
    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },
    #[error("unparseable output from `{command}`: {line}")]
    Parse { command: String, line: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
