//! Server configuration.
//!
//! The configuration file is TOML. Each `[[server]]` table describes a virtual
//! host, each nested `[[server.location]]` table a route prefix inside it.
//! Location settings left unset are filled from the owning server once, while
//! loading, so the rest of the crate only ever sees resolved values.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use serde_derive::Deserialize;

use crate::error::{Result, ServerError};

pub const DEFAULT_ROOT: &str = ".";
pub const DEFAULT_CLIENT_MAX_BODY_SIZE: usize = 100;
pub const MAX_CLIENT_MAX_BODY_SIZE: usize = 50 * 1024 * 1024;
pub const DEFAULT_PORT: u16 = 8080;
pub const SUPPORTED_METHODS: &[&str] = &["GET", "POST", "DELETE"];

#[derive(Debug, Clone)]
pub struct Config {
    pub reactor: ReactorConfig,
    pub logging: LoggingConfig,
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    pub max_events: usize,
    pub poll_interval_ms: i32,
    pub client_timeout_secs: u64,
    pub cgi_timeout_secs: u64,
    pub max_send_retries: u32,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            max_events: 128,
            poll_interval_ms: 1000,
            client_timeout_secs: 30,
            cgi_timeout_secs: 30,
            max_send_retries: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Redirect {
    pub code: u16,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub realm: String,
    pub user_file: String,
}

/// A virtual host with its locations keyed by route prefix.
#[derive(Debug, Clone)]
pub struct Server {
    pub server_name: String,
    pub host: Ipv4Addr,
    pub ports: Vec<u16>,
    pub root: String,
    pub client_max_body_size: usize,
    pub error_pages: HashMap<u16, String>,
    pub locations: HashMap<String, Location>,
}

#[derive(Debug, Clone)]
pub struct Location {
    pub route: String,
    pub alias: Option<String>,
    pub root: String,
    pub index: Vec<String>,
    pub autoindex: bool,
    pub client_max_body_size: usize,
    pub methods: Vec<String>,
    /// File extension (with leading dot) to interpreter. `None` runs the script itself.
    pub cgi: HashMap<String, Option<String>>,
    pub error_pages: HashMap<u16, String>,
    pub redirect: Option<Redirect>,
    pub auth: Option<BasicAuth>,
}

/// An `(address, port)` pair and the servers answering on it. The first
/// server is the default virtual host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddrV4,
    pub servers: Vec<usize>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ServerError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Config::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config> {
        let raw: RawConfig = toml::from_str(content)?;
        let base = std::env::current_dir()?;

        let servers = raw
            .servers
            .into_iter()
            .enumerate()
            .map(|(idx, server)| server.resolve(idx, &base))
            .collect::<Result<Vec<_>>>()?;

        let config = Config {
            reactor: raw.reactor,
            logging: raw.logging,
            servers,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(ServerError::InvalidConfig("no [[server]] defined".into()));
        }
        if self.reactor.max_events == 0 {
            return Err(ServerError::InvalidConfig("max_events cannot be 0".into()));
        }
        if self.reactor.poll_interval_ms <= 0 {
            return Err(ServerError::InvalidConfig(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.reactor.client_timeout_secs == 0 || self.reactor.cgi_timeout_secs == 0 {
            return Err(ServerError::InvalidConfig("timeouts cannot be 0".into()));
        }
        for server in &self.servers {
            for location in server.locations.values() {
                if !location.route.starts_with('/') {
                    return Err(ServerError::InvalidConfig(format!(
                        "location route {:?} must start with '/'",
                        location.route
                    )));
                }
                if let Some(redirect) = &location.redirect {
                    if !(300..400).contains(&redirect.code) {
                        return Err(ServerError::InvalidConfig(format!(
                            "return code {} in {} is not a redirect",
                            redirect.code, location.route
                        )));
                    }
                }
                if let Some(method) = location
                    .methods
                    .iter()
                    .find(|m| !SUPPORTED_METHODS.contains(&m.as_str()))
                {
                    return Err(ServerError::InvalidConfig(format!(
                        "unsupported method {} in {}",
                        method, location.route
                    )));
                }
            }
        }
        Ok(())
    }

    /// Groups servers by listening address, keeping configuration order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = Vec::new();
        for (idx, server) in self.servers.iter().enumerate() {
            for &port in &server.ports {
                let addr = SocketAddrV4::new(server.host, port);
                // Ephemeral ports never share a socket.
                let existing = if port == 0 {
                    None
                } else {
                    endpoints.iter_mut().find(|e| e.addr == addr)
                };
                match existing {
                    Some(endpoint) => endpoint.servers.push(idx),
                    None => endpoints.push(Endpoint {
                        addr,
                        servers: vec![idx],
                    }),
                }
            }
        }
        endpoints
    }
}

impl Endpoint {
    /// Picks the virtual host named by the `Host` header, or the default one.
    pub fn select(&self, servers: &[Server], host: Option<&str>) -> usize {
        let name = host.map(|h| h.rsplit_once(':').map_or(h, |(name, _)| name));
        if let Some(name) = name {
            for &idx in &self.servers {
                if servers[idx].server_name.eq_ignore_ascii_case(name) {
                    return idx;
                }
            }
        }
        self.servers[0]
    }
}

impl Server {
    /// Longest-prefix location lookup: tries `uri` itself, then strips the
    /// last `/segment` until `/` has been tried.
    pub fn location(&self, uri: &str) -> Option<&Location> {
        let mut route = uri;
        loop {
            if let Some(location) = self.locations.get(route) {
                return Some(location);
            }
            let parent = match route.rfind('/') {
                Some(0) | None => "/",
                Some(pos) => &route[..pos],
            };
            if parent == route {
                return None;
            }
            route = parent;
        }
    }

    /// Body size limit for `uri`: the matched location's, else the server's.
    pub fn max_body_size(&self, uri: &str) -> usize {
        self.location(uri)
            .map_or(self.client_max_body_size, |l| l.client_max_body_size)
    }
}

impl Location {
    pub fn allows(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    /// Document root handed to CGI scripts.
    pub fn document_root(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.root)
    }

    pub fn interpreter_for(&self, path: &str) -> Option<&Option<String>> {
        let ext = extension(path)?;
        self.cgi.get(ext)
    }
}

/// Extension including the leading dot, taken from the last path segment.
pub fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rfind('.').map(|pos| &name[pos..])
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    reactor: ReactorConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default, rename = "server")]
    servers: Vec<RawServer>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    server_name: Option<String>,
    host: Option<String>,
    ports: Option<Vec<u16>>,
    #[serde(flatten)]
    settings: Settings,
    #[serde(default, rename = "location")]
    locations: Vec<RawLocation>,
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    route: String,
    alias: Option<String>,
    #[serde(flatten)]
    settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BodySize {
    Bytes(u64),
    Text(String),
}

/// Settings a location may override. `None` means "inherit".
#[derive(Debug, Default, Clone, Deserialize)]
struct Settings {
    root: Option<String>,
    index: Option<Vec<String>>,
    autoindex: Option<bool>,
    client_max_body_size: Option<BodySize>,
    methods: Option<Vec<String>>,
    cgi: Option<BTreeMap<String, String>>,
    error_pages: Option<BTreeMap<String, String>>,
    #[serde(rename = "return")]
    redirect: Option<Redirect>,
    auth_basic: Option<String>,
    auth_basic_user_file: Option<String>,
}

impl Settings {
    fn inherit(&mut self, parent: &Settings) {
        fn fill<T: Clone>(field: &mut Option<T>, parent: &Option<T>) {
            if field.is_none() {
                *field = parent.clone();
            }
        }
        fill(&mut self.root, &parent.root);
        fill(&mut self.index, &parent.index);
        fill(&mut self.autoindex, &parent.autoindex);
        fill(&mut self.client_max_body_size, &parent.client_max_body_size);
        fill(&mut self.methods, &parent.methods);
        fill(&mut self.cgi, &parent.cgi);
        fill(&mut self.redirect, &parent.redirect);
        fill(&mut self.auth_basic, &parent.auth_basic);
        fill(&mut self.auth_basic_user_file, &parent.auth_basic_user_file);

        // Error pages merge per status code, the location's entries win.
        if let Some(parent_pages) = &parent.error_pages {
            let pages = self.error_pages.get_or_insert_with(BTreeMap::new);
            for (code, path) in parent_pages {
                pages.entry(code.clone()).or_insert_with(|| path.clone());
            }
        }
    }

    fn root(&self, base: &Path) -> String {
        absolute(self.root.as_deref().unwrap_or(DEFAULT_ROOT), base)
    }

    fn client_max_body_size(&self) -> Result<usize> {
        match &self.client_max_body_size {
            None => Ok(DEFAULT_CLIENT_MAX_BODY_SIZE),
            Some(BodySize::Bytes(n)) => check_body_size(*n as u128),
            Some(BodySize::Text(text)) => parse_body_size(text),
        }
    }

    fn error_pages(&self) -> Result<HashMap<u16, String>> {
        let mut pages = HashMap::new();
        for (code, path) in self.error_pages.iter().flatten() {
            let code: u16 = code
                .trim()
                .parse()
                .ok()
                .filter(|c| (300..600).contains(c))
                .ok_or_else(|| {
                    ServerError::InvalidConfig(format!("invalid error_page code {:?}", code))
                })?;
            pages.insert(code, path.clone());
        }
        Ok(pages)
    }

    fn into_location(self, route: String, alias: Option<String>, base: &Path) -> Result<Location> {
        let auth = match (&self.auth_basic, &self.auth_basic_user_file) {
            (Some(realm), Some(file)) if !realm.is_empty() && !file.is_empty() => Some(BasicAuth {
                realm: realm.clone(),
                user_file: absolute(file, base),
            }),
            _ => None,
        };
        let cgi = self
            .cgi
            .iter()
            .flatten()
            .map(|(ext, interpreter)| {
                let ext = if ext.starts_with('.') {
                    ext.clone()
                } else {
                    format!(".{}", ext)
                };
                let interpreter = Some(interpreter.trim())
                    .filter(|i| !i.is_empty())
                    .map(str::to_string);
                (ext, interpreter)
            })
            .collect();

        Ok(Location {
            root: self.root(base),
            alias: alias.filter(|a| !a.is_empty()).map(|a| absolute(&a, base)),
            route,
            index: self.index.clone().unwrap_or_default(),
            autoindex: self.autoindex.unwrap_or(false),
            client_max_body_size: self.client_max_body_size()?,
            methods: self
                .methods
                .clone()
                .unwrap_or_else(|| vec!["GET".to_string()])
                .into_iter()
                .map(|m| m.to_ascii_uppercase())
                .collect(),
            cgi,
            error_pages: self.error_pages()?,
            redirect: self.redirect.clone(),
            auth,
        })
    }
}

impl RawServer {
    fn resolve(self, idx: usize, base: &Path) -> Result<Server> {
        let host = match self.host.as_deref() {
            None | Some("localhost") => Ipv4Addr::LOCALHOST,
            Some(host) => host.parse().map_err(|_| {
                ServerError::InvalidConfig(format!("invalid IPv4 address {:?}", host))
            })?,
        };

        let mut locations = HashMap::new();
        for raw in self.locations {
            let mut settings = raw.settings;
            settings.inherit(&self.settings);
            let location = settings.into_location(raw.route.clone(), raw.alias, base)?;
            // First definition of a route wins.
            locations.entry(raw.route).or_insert(location);
        }

        Ok(Server {
            server_name: self
                .server_name
                .unwrap_or_else(|| format!("server{}", idx + 1)),
            host,
            ports: self.ports.unwrap_or_else(|| vec![DEFAULT_PORT]),
            root: self.settings.root(base),
            client_max_body_size: self.settings.client_max_body_size()?,
            error_pages: self.settings.error_pages()?,
            locations,
        })
    }
}

/// Parses `1024`, `10k`, `2M` or `1g` into bytes, capped at 50 MiB.
pub fn parse_body_size(text: &str) -> Result<usize> {
    let text = text.trim();
    let invalid = || ServerError::InvalidConfig(format!("invalid client_max_body_size {:?}", text));
    let (digits, multiplier) = match text.char_indices().last() {
        Some((pos, c)) if c.is_ascii_alphabetic() => {
            let multiplier: u128 = match c.to_ascii_lowercase() {
                'k' => 1024,
                'm' => 1024 * 1024,
                'g' => 1024 * 1024 * 1024,
                _ => return Err(invalid()),
            };
            (&text[..pos], multiplier)
        }
        _ => (text, 1),
    };
    let value: u128 = digits.parse().map_err(|_| invalid())?;
    check_body_size(value * multiplier)
}

fn check_body_size(bytes: u128) -> Result<usize> {
    if bytes > MAX_CLIENT_MAX_BODY_SIZE as u128 {
        return Err(ServerError::InvalidConfig(format!(
            "client_max_body_size {} exceeds the limit of {} bytes",
            bytes, MAX_CLIENT_MAX_BODY_SIZE
        )));
    }
    Ok(bytes as usize)
}

fn absolute(path: &str, base: &Path) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        let rel = path.trim_start_matches("./");
        let base = base.to_string_lossy();
        let base = base.trim_end_matches('/');
        if rel.is_empty() || rel == "." {
            base.to_string()
        } else {
            format!("{}/{}", base, rel)
        }
    };
    let trimmed = joined.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
