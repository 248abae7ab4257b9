use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use maxminddb::{geoip2, Reader};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::GeoIpConfig;
use crate::error::{Result, SentinelError};

const COUNTRY_DB: &str = "GeoLite2-Country.mmdb";
const CITY_DB: &str = "GeoLite2-City.mmdb";
const ASN_DB: &str = "GeoLite2-ASN.mmdb";

/// (file name, minimum plausible size, required)
const DATABASES: &[(&str, u64, bool)] = &[
    (COUNTRY_DB, 1_000_000, true),
    (ASN_DB, 5_000_000, false),
    (CITY_DB, 30_000_000, false),
];

/// Refresh the databases when older than this.
const MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Serialize)]
pub struct GeoResult {
    pub success: bool,
    pub ip: String,
    pub country: String,
    pub country_code: String,
    pub region: String,
    pub city: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn_org: Option<String>,
}

impl GeoResult {
    fn miss(ip: &str) -> Self {
        Self {
            success: false,
            ip: ip.to_string(),
            country: String::new(),
            country_code: String::new(),
            region: String::new(),
            city: String::new(),
            asn: None,
            asn_org: None,
        }
    }

    fn private(ip: &str) -> Self {
        Self {
            success: true,
            ip: ip.to_string(),
            country: "Private".to_string(),
            country_code: "PRIVATE".to_string(),
            region: String::new(),
            city: String::new(),
            asn: None,
            asn_org: None,
        }
    }
}

/// MaxMind MMDB readers behind RW locks. Readers load lazily on first
/// lookup and are hot-swapped after a mirror download completes.
pub struct GeoIpService {
    dir: PathBuf,
    mirrors: Vec<String>,
    client: reqwest::Client,
    country: RwLock<Option<Reader<Vec<u8>>>>,
    city: RwLock<Option<Reader<Vec<u8>>>>,
    asn: RwLock<Option<Reader<Vec<u8>>>>,
}

fn open_reader(path: &Path) -> Option<Reader<Vec<u8>>> {
    if !path.exists() {
        return None;
    }
    match Reader::open_readfile(path) {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(path = %path.display(), err = %e, "failed to open MMDB");
            None
        }
    }
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn pick_name(names: &geoip2::Names<'_>) -> String {
    names
        .english
        .or(names.simplified_chinese)
        .map(|s| s.to_string())
        .unwrap_or_default()
}

impl GeoIpService {
    pub fn new(cfg: &GeoIpConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .unwrap_or_default();
        Self {
            dir: cfg.dir.clone(),
            mirrors: cfg.mirrors.clone(),
            client,
            country: RwLock::new(None),
            city: RwLock::new(None),
            asn: RwLock::new(None),
        }
    }

    fn ensure_loaded(&self) {
        if self.country.read().unwrap().is_none() {
            let mut guard = self.country.write().unwrap();
            if guard.is_none() {
                *guard = open_reader(&self.dir.join(COUNTRY_DB));
            }
        }
        if self.city.read().unwrap().is_none() {
            let mut guard = self.city.write().unwrap();
            if guard.is_none() {
                *guard = open_reader(&self.dir.join(CITY_DB));
            }
        }
        if self.asn.read().unwrap().is_none() {
            let mut guard = self.asn.write().unwrap();
            if guard.is_none() {
                *guard = open_reader(&self.dir.join(ASN_DB));
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.ensure_loaded();
        self.country.read().unwrap().is_some()
    }

    /// Re-open the databases from disk, swapping each reader under its
    /// write lock.
    pub fn reload(&self) {
        *self.country.write().unwrap() = open_reader(&self.dir.join(COUNTRY_DB));
        *self.city.write().unwrap() = open_reader(&self.dir.join(CITY_DB));
        *self.asn.write().unwrap() = open_reader(&self.dir.join(ASN_DB));
        info!(available = self.country.read().unwrap().is_some(), "geoip readers reloaded");
    }

    pub fn lookup(&self, ip_str: &str) -> GeoResult {
        let Ok(ip) = ip_str.parse::<IpAddr>() else {
            return GeoResult::miss(ip_str);
        };
        if is_private(ip) {
            return GeoResult::private(ip_str);
        }
        self.ensure_loaded();

        let mut out = GeoResult::miss(ip_str);

        // The City database embeds country data; prefer it when present.
        {
            let city_guard = self.city.read().unwrap();
            if let Some(reader) = city_guard.as_ref() {
                if let Ok(Some(rec)) = reader.lookup(ip).and_then(|r| r.decode::<geoip2::City>()) {
                    out.success = true;
                    out.country_code = rec.country.iso_code.unwrap_or_default().to_string();
                    out.country = pick_name(&rec.country.names);
                    if let Some(first) = rec.subdivisions.first() {
                        out.region = pick_name(&first.names);
                    }
                    out.city = pick_name(&rec.city.names);
                }
            }
        }

        if !out.success {
            let country_guard = self.country.read().unwrap();
            if let Some(reader) = country_guard.as_ref() {
                if let Ok(Some(rec)) = reader.lookup(ip).and_then(|r| r.decode::<geoip2::Country>()) {
                    out.success = true;
                    out.country_code = rec.country.iso_code.unwrap_or_default().to_string();
                    out.country = pick_name(&rec.country.names);
                }
            }
        }

        {
            let asn_guard = self.asn.read().unwrap();
            if let Some(reader) = asn_guard.as_ref() {
                if let Ok(Some(rec)) = reader.lookup(ip).and_then(|r| r.decode::<geoip2::Asn>()) {
                    out.asn = rec.autonomous_system_number;
                    out.asn_org = rec.autonomous_system_organization.map(|s| s.to_string());
                }
            }
        }

        out
    }

    pub fn lookup_batch(&self, ips: &[String]) -> HashMap<String, GeoResult> {
        let mut out = HashMap::with_capacity(ips.len());
        for ip in ips {
            if !out.contains_key(ip) {
                out.insert(ip.clone(), self.lookup(ip));
            }
        }
        out
    }

    // -- database acquisition --------------------------------------------

    fn file_is_fresh(&self, name: &str) -> bool {
        let path = self.dir.join(name);
        let Ok(meta) = std::fs::metadata(&path) else {
            return false;
        };
        match meta.modified().and_then(|m| {
            SystemTime::now()
                .duration_since(m)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        }) {
            Ok(age) => age < MAX_AGE,
            Err(_) => false,
        }
    }

    /// Download any absent-or-stale database from the configured mirror
    /// list, then hot-swap the readers. Optional databases may fail
    /// without aborting the refresh; a missing Country database is an
    /// error.
    pub async fn update_databases(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut changed = false;

        for (name, min_size, required) in DATABASES {
            if self.file_is_fresh(name) {
                continue;
            }
            match self.download_one(name, *min_size).await {
                Ok(()) => changed = true,
                Err(e) if *required => {
                    if self.dir.join(name).exists() {
                        warn!(db = name, err = %e, "download failed; keeping existing file");
                    } else {
                        return Err(e);
                    }
                }
                Err(e) => warn!(db = name, err = %e, "optional database download failed"),
            }
        }

        if changed {
            self.reload();
        }
        Ok(())
    }

    async fn download_one(&self, name: &str, min_size: u64) -> Result<()> {
        let mut last_err =
            SentinelError::GeoIp(format!("no mirrors configured for {name}"));

        for mirror in &self.mirrors {
            let url = mirror.replace("{db}", name);
            info!(db = name, url = %url, "downloading geoip database");
            match self.fetch(&url, min_size).await {
                Ok(bytes) => {
                    let tmp = self.dir.join(format!("{name}.tmp"));
                    let dest = self.dir.join(name);
                    std::fs::write(&tmp, &bytes)?;
                    std::fs::rename(&tmp, &dest)?;
                    info!(db = name, size = bytes.len(), "geoip database updated");
                    return Ok(());
                }
                Err(e) => {
                    warn!(db = name, url = %url, err = %e, "mirror failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn fetch(&self, url: &str, min_size: u64) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(SentinelError::GeoIp(format!("{url} returned {}", resp.status())));
        }
        let bytes = resp.bytes().await?;
        if (bytes.len() as u64) < min_size {
            return Err(SentinelError::GeoIp(format!(
                "{url} returned {} bytes, below the {min_size} byte floor",
                bytes.len()
            )));
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_without_dbs() -> GeoIpService {
        GeoIpService::new(&GeoIpConfig {
            dir: std::env::temp_dir().join("sentinel-geoip-test-none"),
            mirrors: vec![],
        })
    }

    #[test]
    fn invalid_ip_is_a_miss() {
        let svc = service_without_dbs();
        let res = svc.lookup("not-an-ip");
        assert!(!res.success);
        assert_eq!(res.ip, "not-an-ip");
    }

    #[test]
    fn private_ranges_short_circuit() {
        let svc = service_without_dbs();
        for ip in ["10.0.0.1", "192.168.1.5", "127.0.0.1", "fc00::1", "::1"] {
            let res = svc.lookup(ip);
            assert!(res.success, "{ip} should be classified");
            assert_eq!(res.country_code, "PRIVATE", "{ip}");
        }
        assert!(!is_private("8.8.8.8".parse().unwrap()));
        assert!(!is_private("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn lookup_without_databases_is_unavailable() {
        let svc = service_without_dbs();
        assert!(!svc.is_available());
        let res = svc.lookup("8.8.8.8");
        assert!(!res.success);
    }

    #[test]
    fn batch_dedupes() {
        let svc = service_without_dbs();
        let ips = vec!["10.0.0.1".to_string(), "10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let out = svc.lookup_batch(&ips);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn database_manifest_sizes() {
        // Country is the only required database and the floors are
        // ordered Country < ASN < City.
        let required: Vec<_> = DATABASES.iter().filter(|(_, _, req)| *req).collect();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0].0, COUNTRY_DB);
        assert!(DATABASES[0].1 < DATABASES[1].1);
        assert!(DATABASES[1].1 < DATABASES[2].1);
    }
}
