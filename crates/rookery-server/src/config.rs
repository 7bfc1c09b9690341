//! INI configuration loading.
//!
//! Top-level keys configure the server itself; every named section
//! belongs to the extension module of the same name and its entries are
//! handed to that module's `configure` callback verbatim:
//!
//! ```ini
//! address = 0.0.0.0
//! port = 5222
//! name = example.net
//!
//! [multicast]
//! address = 225.1.2.104
//! port = 6010
//! bufsize = 30720
//! ```
//!
//! Sections and their entries are sorted by name so boot order does not
//! depend on file order.

use std::collections::HashMap;
use std::path::Path;

use config::{Config, File, FileFormat, Value};

use rookery_xmpp::{ServerOptions, XmppError};

/// One module section from the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSection {
    /// Section name; selects the module.
    pub name: String,
    /// Raw `key = value` entries, passed through unchanged.
    pub entries: Vec<(String, String)>,
}

/// Everything the config file provides.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Server options, defaults filled in for missing keys.
    pub options: ServerOptions,
    /// Module sections in name order.
    pub modules: Vec<ModuleSection>,
}

/// Load and validate an INI configuration file.
pub fn load(path: &Path) -> Result<Settings, XmppError> {
    let source = File::new(
        path.to_str()
            .ok_or_else(|| XmppError::config("config path is not UTF-8"))?,
        FileFormat::Ini,
    );
    let parsed = Config::builder()
        .add_source(source)
        .build()
        .map_err(|e| XmppError::config(format!("cannot read config: {}", e)))?;
    let table: HashMap<String, Value> = parsed
        .try_deserialize()
        .map_err(|e| XmppError::config(format!("cannot parse config: {}", e)))?;

    let mut settings = Settings::default();
    for (key, value) in table {
        match value.clone().into_table() {
            Ok(section) => {
                let mut entries: Vec<(String, String)> = section
                    .into_iter()
                    .map(|(k, v)| {
                        let v = v.into_string().map_err(|e| {
                            XmppError::config(format!("bad value in [{}] {}: {}", key, k, e))
                        })?;
                        Ok::<_, XmppError>((k, v))
                    })
                    .collect::<Result<_, _>>()?;
                entries.sort();
                settings.modules.push(ModuleSection { name: key, entries });
            }
            Err(_) => apply_server_key(&mut settings.options, &key, value)?,
        }
    }
    settings.modules.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(settings)
}

fn apply_server_key(
    options: &mut ServerOptions,
    key: &str,
    value: Value,
) -> Result<(), XmppError> {
    let bad = |e: config::ConfigError| XmppError::config(format!("bad value for {}: {}", key, e));
    match key {
        "address" => options.address = value.into_string().map_err(bad)?,
        "port" => {
            let port = value.into_int().map_err(bad)?;
            options.port = u16::try_from(port)
                .map_err(|_| XmppError::config(format!("port {} out of range", port)))?;
        }
        "ssl" => options.ssl = value.into_bool().map_err(bad)?,
        "keyfile" => options.keyfile = value.into_string().map_err(bad)?,
        "certificate" => options.certificate = value.into_string().map_err(bad)?,
        "name" => options.name = value.into_string().map_err(bad)?,
        other => {
            return Err(XmppError::config(format!(
                "unknown configuration key '{}'",
                other
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".ini")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn parses_server_keys_and_module_sections() {
        let file = write_config(
            "address = 0.0.0.0\n\
             port = 5224\n\
             ssl = false\n\
             name = example.net\n\
             \n\
             [multicast]\n\
             address = 226.0.0.1\n\
             port = 7010\n\
             bufsize = 4096\n",
        );

        let settings = load(file.path()).unwrap();
        assert_eq!(settings.options.address, "0.0.0.0");
        assert_eq!(settings.options.port, 5224);
        assert!(!settings.options.ssl);
        assert_eq!(settings.options.name, "example.net");

        assert_eq!(settings.modules.len(), 1);
        let section = &settings.modules[0];
        assert_eq!(section.name, "multicast");
        assert_eq!(
            section.entries,
            vec![
                ("address".to_owned(), "226.0.0.1".to_owned()),
                ("bufsize".to_owned(), "4096".to_owned()),
                ("port".to_owned(), "7010".to_owned()),
            ]
        );
    }

    #[test]
    fn missing_keys_keep_defaults() {
        let file = write_config("name = chat.example.net\n");
        let settings = load(file.path()).unwrap();
        assert_eq!(settings.options.address, "127.0.0.1");
        assert_eq!(settings.options.port, 5222);
        assert_eq!(settings.options.name, "chat.example.net");
        assert!(settings.modules.is_empty());
    }

    #[test]
    fn unknown_top_level_keys_are_fatal() {
        let file = write_config("colour = teal\n");
        assert!(matches!(load(file.path()), Err(XmppError::Config(_))));
    }

    #[test]
    fn out_of_range_port_is_fatal() {
        let file = write_config("port = 131072\n");
        assert!(matches!(load(file.path()), Err(XmppError::Config(_))));
    }

    #[test]
    fn missing_file_is_fatal() {
        assert!(load(Path::new("/nonexistent/rookery.ini")).is_err());
    }
}
