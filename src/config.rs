use serde_derive::Deserialize;
use std::collections::HashMap;
use std::fs;

use crate::error::ServerError;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CGI_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_cgi_timeout")]
    pub cgi_timeout_secs: u64,
    #[serde(rename = "server")]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub server_names: Vec<String>,
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default = "default_index")]
    pub index: Vec<String>,
    #[serde(default = "default_max_body")]
    pub client_max_body_size: usize,
    #[serde(default)]
    pub error_pages: HashMap<String, String>,
    #[serde(default, rename = "location")]
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    pub path: String,
    pub root: Option<String>,
    pub index: Option<Vec<String>>,
    pub allowed_methods: Option<Vec<String>>,
    #[serde(default)]
    pub autoindex: bool,
    pub upload_path: Option<String>,
    pub client_max_body_size: Option<usize>,
    #[serde(default)]
    pub cgi: HashMap<String, String>,
    #[serde(default)]
    pub error_pages: HashMap<String, String>,
    pub redirect: Option<Redirect>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Redirect {
    pub status: u16,
    pub target: String,
}

/// A location block with server-level defaults already folded in. This is
/// what request handling consumes; it never has to reach back into the
/// server record for a missing field.
#[derive(Debug, Clone)]
pub struct Location {
    pub path: String,
    pub root: String,
    pub index: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub autoindex: bool,
    pub upload_path: Option<String>,
    pub max_body_size: usize,
    pub cgi: HashMap<String, String>,
    pub error_pages: HashMap<String, String>,
    pub redirect: Option<(u16, String)>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_cgi_timeout() -> u64 {
    DEFAULT_CGI_TIMEOUT_SECS
}

fn default_root() -> String {
    String::from("www")
}

fn default_index() -> Vec<String> {
    vec![String::from("index.html")]
}

fn default_max_body() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

impl Config {
    pub fn load(path: &str) -> Result<Config, ServerError> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.servers.is_empty() {
            return Err(ServerError::InvalidConfig(
                "at least one [[server]] block is required".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ServerError::InvalidConfig("timeout_secs cannot be 0".into()));
        }
        for server in &self.servers {
            if server.port == 0 {
                return Err(ServerError::InvalidConfig("port cannot be 0".into()));
            }
            for location in &server.locations {
                if !location.path.starts_with('/') {
                    return Err(ServerError::InvalidConfig(format!(
                        "location path {:?} must start with '/'",
                        location.path
                    )));
                }
                if let Some(redirect) = &location.redirect {
                    if !(300..400).contains(&redirect.status) {
                        return Err(ServerError::InvalidConfig(format!(
                            "redirect status {} is not a 3xx code",
                            redirect.status
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Longest-prefix location match with fallback to `/`. The `/` location
    /// is synthesized from server-level defaults when no block declares it,
    /// so a match always exists.
    pub fn match_location(&self, path: &str) -> Location {
        let mut best: Option<&LocationConfig> = None;
        for location in &self.locations {
            if path_matches(path, &location.path) {
                if best.map_or(true, |b| location.path.len() > b.path.len()) {
                    best = Some(location);
                }
            }
        }
        match best {
            Some(location) => self.resolve(location),
            None => self.root_location(),
        }
    }

    fn resolve(&self, location: &LocationConfig) -> Location {
        Location {
            path: location.path.clone(),
            root: location.root.clone().unwrap_or_else(|| self.root.clone()),
            index: location.index.clone().unwrap_or_else(|| self.index.clone()),
            allowed_methods: location
                .allowed_methods
                .clone()
                .unwrap_or_else(default_methods),
            autoindex: location.autoindex,
            upload_path: location.upload_path.clone(),
            max_body_size: location
                .client_max_body_size
                .unwrap_or(self.client_max_body_size),
            cgi: location.cgi.clone(),
            error_pages: if location.error_pages.is_empty() {
                self.error_pages.clone()
            } else {
                location.error_pages.clone()
            },
            redirect: location
                .redirect
                .as_ref()
                .map(|r| (r.status, r.target.clone())),
        }
    }

    fn root_location(&self) -> Location {
        Location {
            path: String::from("/"),
            root: self.root.clone(),
            index: self.index.clone(),
            allowed_methods: default_methods(),
            autoindex: false,
            upload_path: None,
            max_body_size: self.client_max_body_size,
            cgi: HashMap::new(),
            error_pages: self.error_pages.clone(),
            redirect: None,
        }
    }
}

fn default_methods() -> Vec<String> {
    vec!["GET".into(), "POST".into(), "DELETE".into()]
}

/// Prefix match on path segments: `/img` matches `/img` and `/img/x.png`
/// but not `/imgs`. `/` matches everything.
fn path_matches(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    path == prefix || path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/')
}

/// Selects the virtual server for a Host header value within the group of
/// servers bound to one listening socket. A host with no name match falls
/// back to the first server of the group (the default virtual host).
pub fn match_server<'a>(group: &'a [&'a ServerConfig], host: &str) -> Option<&'a ServerConfig> {
    let name = host.split(':').next().unwrap_or(host);
    for server in group {
        if server.server_names.iter().any(|n| n == name) {
            return Some(server);
        }
    }
    group.first().copied()
}

impl Location {
    pub fn allows_method(&self, method: &str) -> bool {
        self.allowed_methods.iter().any(|m| m == method)
    }

    pub fn error_page(&self, status: u16) -> Option<&String> {
        self.error_pages.get(&status.to_string())
    }

    /// Interpreter for a URI path, looked up by its extension in the
    /// location's CGI map. `None` means the path is not a CGI target.
    pub fn cgi_interpreter(&self, path: &str) -> Option<&String> {
        let dot = path.rfind('.')?;
        self.cgi.get(&path[dot..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        timeout_secs = 30

        [[server]]
        host = "127.0.0.1"
        port = 8080
        server_names = ["example.com"]
        root = "www"
        client_max_body_size = 2048

        [[server.location]]
        path = "/"
        autoindex = true

        [[server.location]]
        path = "/cgi-bin"
        allowed_methods = ["GET", "POST"]
        [server.location.cgi]
        ".py" = "/usr/bin/python3"

        [[server]]
        host = "127.0.0.1"
        port = 8080
        server_names = ["other.com"]
    "#;

    fn sample() -> Config {
        toml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn parses_and_validates() {
        let config = sample();
        config.validate().unwrap();
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.cgi_timeout_secs, 10);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].client_max_body_size, 2048);
    }

    #[test]
    fn longest_prefix_wins() {
        let config = sample();
        let server = &config.servers[0];
        assert_eq!(server.match_location("/cgi-bin/test.py").path, "/cgi-bin");
        assert_eq!(server.match_location("/cgi-bin").path, "/cgi-bin");
        assert_eq!(server.match_location("/cgi-binary").path, "/");
        assert_eq!(server.match_location("/index.html").path, "/");
    }

    #[test]
    fn location_inherits_server_defaults() {
        let config = sample();
        let location = config.servers[0].match_location("/cgi-bin/test.py");
        assert_eq!(location.root, "www");
        assert_eq!(location.max_body_size, 2048);
        assert_eq!(location.allowed_methods, vec!["GET", "POST"]);
    }

    #[test]
    fn root_location_synthesized_when_absent() {
        let config = sample();
        let location = config.servers[1].match_location("/anything");
        assert_eq!(location.path, "/");
        assert_eq!(location.root, "www");
        assert!(location.allows_method("DELETE"));
    }

    #[test]
    fn host_match_falls_back_to_default_vhost() {
        let config = sample();
        let group: Vec<&ServerConfig> = config.servers.iter().collect();
        let matched = match_server(&group, "other.com:8080").unwrap();
        assert_eq!(matched.server_names, vec!["other.com"]);
        let fallback = match_server(&group, "unknown.org").unwrap();
        assert_eq!(fallback.server_names, vec!["example.com"]);
        assert!(match_server(&[], "any").is_none());
    }

    #[test]
    fn cgi_interpreter_by_extension() {
        let config = sample();
        let location = config.servers[0].match_location("/cgi-bin/test.py");
        assert_eq!(
            location.cgi_interpreter("/cgi-bin/test.py").unwrap(),
            "/usr/bin/python3"
        );
        assert!(location.cgi_interpreter("/cgi-bin/readme.txt").is_none());
        assert!(location.cgi_interpreter("/cgi-bin/noext").is_none());
    }

    #[test]
    fn rejects_bad_location_path() {
        let mut config = sample();
        config.servers[0].locations[0].path = String::from("nope");
        assert!(config.validate().is_err());
    }
}
