use std::io;
use std::path::Path;

pub const MAX_CLIENTS: usize = 128;
pub const MAX_ROOMS: usize = 64;

/// Effective server configuration: defaults, overlaid by the config file,
/// overlaid by command-line flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    pub max_clients: usize,
    pub max_rooms: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ip: "0.0.0.0".to_string(),
            port: 7777,
            max_clients: 128,
            max_rooms: 32,
        }
    }
}

impl ServerConfig {
    /// Loads an INI-like file: one `key=value` per line, `#` and `;` start
    /// comments, surrounding whitespace is trimmed, unknown keys are ignored.
    pub fn load_file(&mut self, path: &Path) -> io::Result<()> {
        let text = std::fs::read_to_string(path)?;
        for line in text.lines() {
            self.apply_line(line);
        }
        Ok(())
    }

    fn apply_line(&mut self, line: &str) {
        let line = match line.find(['#', ';']) {
            Some(pos) => &line[..pos],
            None => line,
        };
        let Some((key, val)) = line.split_once('=') else {
            return;
        };
        let key = key.trim();
        let val = val.trim();
        if key.is_empty() || val.is_empty() {
            return;
        }
        match key {
            "ip" => self.ip = val.to_string(),
            "port" => {
                if let Ok(port) = val.parse() {
                    self.port = port;
                }
            }
            "max_clients" => {
                if let Ok(n) = val.parse() {
                    self.max_clients = n;
                }
            }
            "max_rooms" => {
                if let Ok(n) = val.parse() {
                    self.max_rooms = n;
                }
            }
            _ => {}
        }
    }

    /// Rejects unusable values and clamps the limits to their hard caps.
    pub fn validate_and_clamp(&mut self) -> Result<(), String> {
        if self.port == 0 {
            return Err("invalid port (0)".to_string());
        }
        if self.max_clients < 1 {
            return Err(format!("invalid max_clients {}", self.max_clients));
        }
        if self.max_rooms < 1 {
            return Err(format!("invalid max_rooms {}", self.max_rooms));
        }
        if self.max_clients > MAX_CLIENTS {
            self.max_clients = MAX_CLIENTS;
        }
        if self.max_rooms > MAX_ROOMS {
            self.max_rooms = MAX_ROOMS;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_lines(lines: &[&str]) -> ServerConfig {
        let mut cfg = ServerConfig::default();
        for line in lines {
            cfg.apply_line(line);
        }
        cfg
    }

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.ip, "0.0.0.0");
        assert_eq!(cfg.port, 7777);
        assert_eq!(cfg.max_clients, 128);
        assert_eq!(cfg.max_rooms, 32);
    }

    #[test]
    fn parses_keys_with_whitespace() {
        let cfg = from_lines(&["  ip = 127.0.0.1  ", "port=9000", " max_rooms =8"]);
        assert_eq!(cfg.ip, "127.0.0.1");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.max_rooms, 8);
    }

    #[test]
    fn comments_and_unknown_keys_are_ignored() {
        let cfg = from_lines(&[
            "# full line comment",
            "; another",
            "port=9000 # trailing",
            "color=blue",
            "",
            "not a pair",
        ]);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.ip, "0.0.0.0");
    }

    #[test]
    fn unparsable_numbers_keep_previous_value() {
        let cfg = from_lines(&["port=many", "max_clients=-3"]);
        assert_eq!(cfg.port, 7777);
        assert_eq!(cfg.max_clients, 128);
    }

    #[test]
    fn validate_clamps_limits() {
        let mut cfg = ServerConfig::default();
        cfg.max_clients = 1000;
        cfg.max_rooms = 1000;
        cfg.validate_and_clamp().unwrap();
        assert_eq!(cfg.max_clients, MAX_CLIENTS);
        assert_eq!(cfg.max_rooms, MAX_ROOMS);
    }

    #[test]
    fn validate_rejects_zero_values() {
        let mut cfg = ServerConfig::default();
        cfg.port = 0;
        assert!(cfg.validate_and_clamp().is_err());

        let mut cfg = ServerConfig::default();
        cfg.max_rooms = 0;
        assert!(cfg.validate_and_clamp().is_err());
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let mut cfg = ServerConfig::default();
        assert!(cfg
            .load_file(Path::new("/definitely/not/here.ini"))
            .is_err());
        assert_eq!(cfg, ServerConfig::default());
    }
}
