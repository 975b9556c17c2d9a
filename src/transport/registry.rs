//! Scheme-to-transport registry.
//!
//! Each scheme registers by value: its name, required and optional URI
//! fields, default port, and an open function. Dispatch validates the
//! URI shape against the descriptor before opening.
//!
//! SSH-family schemes honor `GIT_SSH` / `GIT_SSH_COMMAND`: when either
//! is set, the external command is preferred over any built-in carrier
//! even if one exists. Surprising, but deployments that wrap ssh depend
//! on it, so the historical precedence is kept.

use crate::env::Environment;

use super::local::LocalTransport;
use super::uri::Uri;
use super::{Transport, TransportError};

/// URI fields a scheme may require or accept.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FieldSet {
    pub user: bool,
    pub pass: bool,
    pub host: bool,
    pub port: bool,
    pub path: bool,
}

impl FieldSet {
    const fn host_path() -> Self {
        Self {
            user: false,
            pass: false,
            host: true,
            port: false,
            path: true,
        }
    }

    const fn path_only() -> Self {
        Self {
            user: false,
            pass: false,
            host: false,
            port: false,
            path: true,
        }
    }

    const fn all_remote() -> Self {
        Self {
            user: true,
            pass: true,
            host: true,
            port: true,
            path: true,
        }
    }
}

/// Open function producing a connected transport.
pub type OpenFn = fn(&Uri, &Environment) -> Result<Box<dyn Transport>, TransportError>;

/// One registered scheme.
#[derive(Clone)]
pub struct TransportScheme {
    /// Scheme name (`ssh`, `https`, ...).
    pub name: &'static str,
    /// Fields the URI must carry.
    pub required: FieldSet,
    /// Fields the URI may carry.
    pub optional: FieldSet,
    /// Default port when the URI names none.
    pub default_port: Option<u16>,
    /// Connector.
    pub open: OpenFn,
}

impl std::fmt::Debug for TransportScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportScheme")
            .field("name", &self.name)
            .field("default_port", &self.default_port)
            .finish_non_exhaustive()
    }
}

/// Registry of transport schemes.
pub struct TransportRegistry {
    schemes: Vec<TransportScheme>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl TransportRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schemes: Vec::new(),
        }
    }

    /// Registry carrying the standard scheme set.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TransportScheme {
            name: "file",
            required: FieldSet::path_only(),
            optional: FieldSet::path_only(),
            default_port: None,
            open: open_file,
        });
        for name in ["ssh", "ssh+git", "git+ssh"] {
            registry.register(TransportScheme {
                name,
                required: FieldSet::host_path(),
                optional: FieldSet::all_remote(),
                default_port: Some(22),
                open: open_external_ssh,
            });
        }
        registry.register(TransportScheme {
            name: "git",
            required: FieldSet::host_path(),
            optional: FieldSet {
                user: false,
                pass: false,
                host: true,
                port: true,
                path: true,
            },
            default_port: Some(9418),
            open: open_no_carrier,
        });
        for (name, port) in [("http", 80u16), ("https", 443)] {
            registry.register(TransportScheme {
                name,
                required: FieldSet::host_path(),
                optional: FieldSet::all_remote(),
                default_port: Some(port),
                open: open_no_carrier,
            });
        }
        for (name, port) in [("ftp", 21u16), ("ftps", 990), ("sftp", 22)] {
            registry.register(TransportScheme {
                name,
                required: FieldSet::host_path(),
                optional: FieldSet::all_remote(),
                default_port: Some(port),
                open: open_no_carrier,
            });
        }
        registry
    }

    /// Adds or replaces a scheme (by-value registration).
    pub fn register(&mut self, scheme: TransportScheme) {
        self.schemes.retain(|existing| existing.name != scheme.name);
        self.schemes.push(scheme);
    }

    /// Finds a scheme descriptor.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&TransportScheme> {
        self.schemes.iter().find(|scheme| scheme.name == name)
    }

    /// Validates the URI against its scheme and opens a transport.
    pub fn open(&self, uri: &Uri, env: &Environment) -> Result<Box<dyn Transport>, TransportError> {
        let name = uri.scheme_or_file();
        let scheme = self
            .find(name)
            .ok_or_else(|| TransportError::UnsupportedScheme {
                scheme: name.to_owned(),
            })?;

        let bad = |field: &str| TransportError::BadUri {
            detail: format!("{name} URI missing {field}"),
        };
        if scheme.required.host && uri.host.is_none() {
            return Err(bad("host"));
        }
        if scheme.required.path && uri.path.is_empty() {
            return Err(bad("path"));
        }
        if uri.port.is_some() && !scheme.optional.port && !scheme.required.port {
            return Err(TransportError::BadUri {
                detail: format!("{name} URI does not accept a port"),
            });
        }

        (scheme.open)(uri, env)
    }
}

fn open_file(uri: &Uri, _env: &Environment) -> Result<Box<dyn Transport>, TransportError> {
    Ok(Box::new(LocalTransport::new(std::path::Path::new(
        &uri.path,
    ))))
}

/// SSH-family connector: defers to `GIT_SSH`/`GIT_SSH_COMMAND` when set
/// (preferred over any built-in), otherwise reports the missing carrier.
fn open_external_ssh(uri: &Uri, env: &Environment) -> Result<Box<dyn Transport>, TransportError> {
    let external = env
        .var("GIT_SSH")
        .or_else(|| env.var("GIT_SSH_COMMAND"));
    match external {
        Some(_command) => {
            // The subprocess carrier (spawn + pipe + stderr drain) lives
            // outside this crate; the registry only routes to it.
            Err(TransportError::NoCarrier {
                scheme: format!("{} (external ssh)", uri.scheme_or_file()),
            })
        }
        None => Err(TransportError::NoCarrier {
            scheme: uri.scheme_or_file().to_owned(),
        }),
    }
}

fn open_no_carrier(uri: &Uri, _env: &Environment) -> Result<Box<dyn Transport>, TransportError> {
    Err(TransportError::NoCarrier {
        scheme: uri.scheme_or_file().to_owned(),
    })
}
