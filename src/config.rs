// =============================================================================
// Configuration — INI file loader for the §6 external configuration
// collaborator, plus the `--makeconfig` template writer.
// =============================================================================
//
// Grounded on `original_source/Src/config.cpp`: sparse 0-indexed
// `[PROXY_N]`/`[STOCK_EXCHANGE_N]` sections, fatal validation of an invalid
// or empty `Type`/`KLineTypes`, and a config-template generator
// (`Config::makeConfig`).

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use config::{Config as ConfigSource, File, FileFormat};
use tracing::info;

use crate::fetcher::ProxyEntry;
use crate::types::KLineInterval;

#[derive(Debug, Clone)]
pub struct StockExchangeConfig {
    pub venue_type: String,
    pub user: String,
    pub password: String,
    pub kline_intervals: Vec<KLineInterval>,
    pub symbol_prefixes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub debug_mode: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub system: SystemConfig,
    pub server: ServerConfig,
    pub proxies: Vec<ProxyEntry>,
    pub stock_exchanges: Vec<StockExchangeConfig>,
}

/// Known venue type names — §6 "Type (one of the venue enum names)".
const KNOWN_VENUE_TYPES: &[&str] = &["Binance", "Bybit", "Moex"];

/// Sparse section indices are scanned up to this bound, matching the
/// original's `config.cpp` loop to 255.
const MAX_SECTION_INDEX: u32 = 256;

impl AppConfig {
    pub fn load(path: &str) -> Result<Self> {
        let source = ConfigSource::builder()
            .add_source(File::new(path, FileFormat::Ini))
            .build()
            .with_context(|| format!("failed to read config file {path}"))?;

        let table = source.try_deserialize::<HashMap<String, HashMap<String, String>>>()
            .context("config file is not a valid INI document")?;

        let database = Self::parse_database(&table)?;
        let system = Self::parse_system(&table);
        let server = Self::parse_server(&table)?;
        let proxies = Self::parse_proxies(&table)?;
        let stock_exchanges = Self::parse_stock_exchanges(&table)?;

        if stock_exchanges.is_empty() {
            bail!("no valid [STOCK_EXCHANGE_N] sections found");
        }

        Ok(Self {
            database,
            system,
            server,
            proxies,
            stock_exchanges,
        })
    }

    fn parse_database(table: &HashMap<String, HashMap<String, String>>) -> Result<DatabaseConfig> {
        let section = table.get("database").context("missing [DATABASE] section")?;
        let url = section
            .get("database")
            .context("missing DATABASE.DataBase key")?
            .clone();
        Ok(DatabaseConfig { url })
    }

    fn parse_system(table: &HashMap<String, HashMap<String, String>>) -> SystemConfig {
        let debug_mode = table
            .get("system")
            .and_then(|s| s.get("debugmode"))
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);
        SystemConfig { debug_mode }
    }

    fn parse_server(table: &HashMap<String, HashMap<String, String>>) -> Result<ServerConfig> {
        let section = table.get("server").context("missing [SERVER] section")?;
        let address = section.get("address").cloned().unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = section
            .get("port")
            .context("missing SERVER.Port key")?
            .parse()
            .context("SERVER.Port is not a valid u16")?;
        let name = section.get("name").cloned().unwrap_or_else(|| "kline-sentry".to_string());
        Ok(ServerConfig { address, port, name })
    }

    fn parse_proxies(table: &HashMap<String, HashMap<String, String>>) -> Result<Vec<ProxyEntry>> {
        let mut proxies = Vec::new();
        for n in 0..MAX_SECTION_INDEX {
            let Some(section) = table.get(&format!("proxy_{n}")) else {
                continue;
            };
            let host = section.get("host").context("PROXY_N missing Host key")?.clone();
            let port: u16 = section
                .get("port")
                .context("PROXY_N missing Port key")?
                .parse()
                .context("PROXY_N.Port is not a valid u16")?;
            let user = section.get("user").cloned();
            let password = section.get("password").cloned();
            proxies.push(ProxyEntry { host, port, user, password });
        }
        Ok(proxies)
    }

    fn parse_stock_exchanges(table: &HashMap<String, HashMap<String, String>>) -> Result<Vec<StockExchangeConfig>> {
        let mut out = Vec::new();
        for n in 0..MAX_SECTION_INDEX {
            let Some(section) = table.get(&format!("stock_exchange_{n}")) else {
                continue;
            };
            let venue_type = section.get("type").cloned().unwrap_or_default();
            if venue_type.is_empty() || !KNOWN_VENUE_TYPES.contains(&venue_type.as_str()) {
                bail!("STOCK_EXCHANGE_{n}: invalid or empty Type '{venue_type}'");
            }
            let kline_types_raw = section.get("klinetypes").cloned().unwrap_or_default();
            let kline_intervals: Vec<KLineInterval> = kline_types_raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .filter_map(KLineInterval::parse)
                .collect();
            if kline_intervals.is_empty() {
                bail!("STOCK_EXCHANGE_{n}: KLineTypes is empty or unparsable");
            }
            let symbol_prefixes = section
                .get("klinenames")
                .map(|s| s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(String::from).collect())
                .unwrap_or_default();
            out.push(StockExchangeConfig {
                venue_type,
                user: section.get("user").cloned().unwrap_or_default(),
                password: section.get("password").cloned().unwrap_or_default(),
                kline_intervals,
                symbol_prefixes,
            });
        }
        Ok(out)
    }
}

/// Write a commented template INI and return its path, mirroring the
/// original's `Config::makeConfig`.
pub fn make_config_template(path: &str) -> Result<()> {
    let template = r#"[DATABASE]
DataBase=kline_sentry.db

[SYSTEM]
DebugMode=false

[SERVER]
Address=0.0.0.0
Port=8080
Name=kline-sentry

[PROXY_0]
Host=proxy.example.com
Port=3128
User=
Password=

[STOCK_EXCHANGE_0]
Type=Binance
User=
Password=
KLineTypes=1m,5m,1h
KLineNames=
"#;
    std::fs::write(path, template).with_context(|| format!("failed to write config template to {path}"))?;
    info!(path, "config template written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_ini(contents: &str) -> tempfile_path::TempIni {
        tempfile_path::TempIni::new(contents)
    }

    // Minimal temp-file helper scoped to this test module; avoids pulling in
    // an extra dev-dependency purely for a handful of config-parsing tests.
    mod tempfile_path {
        use std::io::Write;
        pub struct TempIni {
            pub path: std::path::PathBuf,
        }
        impl TempIni {
            pub fn new(contents: &str) -> Self {
                let path = std::env::temp_dir().join(format!("kline-sentry-test-{}.ini", rand::random::<u64>()));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(contents.as_bytes()).unwrap();
                Self { path }
            }
        }
        impl Drop for TempIni {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    const VALID: &str = r#"
[DATABASE]
DataBase=test.db

[SERVER]
Port=8080

[STOCK_EXCHANGE_0]
Type=Binance
KLineTypes=1m,5m
"#;

    #[test]
    fn loads_valid_config() {
        let tmp = write_temp_ini(VALID);
        let cfg = AppConfig::load(tmp.path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.stock_exchanges.len(), 1);
        assert_eq!(cfg.stock_exchanges[0].venue_type, "Binance");
        assert_eq!(cfg.stock_exchanges[0].kline_intervals.len(), 2);
    }

    #[test]
    fn rejects_invalid_venue_type() {
        let bad = VALID.replace("Type=Binance", "Type=NotAVenue");
        let tmp = write_temp_ini(&bad);
        assert!(AppConfig::load(tmp.path.to_str().unwrap()).is_err());
    }

    #[test]
    fn rejects_empty_kline_types() {
        let bad = VALID.replace("KLineTypes=1m,5m", "KLineTypes=");
        let tmp = write_temp_ini(&bad);
        assert!(AppConfig::load(tmp.path.to_str().unwrap()).is_err());
    }

    #[test]
    fn sparse_proxy_sections_parse_in_order() {
        let with_proxies = format!(
            "{VALID}\n[PROXY_0]\nHost=p0\nPort=1\n\n[PROXY_2]\nHost=p2\nPort=2\n"
        );
        let tmp = write_temp_ini(&with_proxies);
        let cfg = AppConfig::load(tmp.path.to_str().unwrap()).unwrap();
        // PROXY_1 is missing but the scan does not stop there: PROXY_2 is
        // still picked up.
        assert_eq!(cfg.proxies.len(), 2);
        assert_eq!(cfg.proxies[0].host, "p0");
        assert_eq!(cfg.proxies[1].host, "p2");
    }

    #[test]
    fn sparse_stock_exchange_sections_parse_past_gap() {
        let with_gap = format!(
            "{VALID}\n[STOCK_EXCHANGE_2]\nType=Bybit\nKLineTypes=1h\n"
        );
        let tmp = write_temp_ini(&with_gap);
        let cfg = AppConfig::load(tmp.path.to_str().unwrap()).unwrap();
        // STOCK_EXCHANGE_1 is missing but STOCK_EXCHANGE_2 is still picked up.
        assert_eq!(cfg.stock_exchanges.len(), 2);
        assert_eq!(cfg.stock_exchanges[1].venue_type, "Bybit");
    }
}
