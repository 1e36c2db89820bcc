//! Deterministic vhost rendering.
//!
//! The emitter is plain typed code writing into a `String`: for a fixed
//! `SiteTemplateData` the output is byte-identical across runs, which is what
//! the render-hash change detection relies on.

use std::fmt::Write as _;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct CacheCfg {
    pub enabled: bool,
    pub zone: String,
    pub ttl_200: String,
}

#[derive(Clone, Debug)]
pub struct FastCgiCfg {
    /// e.g. "unix:/run/php/ngm-site1_example-8.3.sock"
    pub pass: String,
    pub cache: CacheCfg,
}

#[derive(Clone, Debug)]
pub struct UpstreamTarget {
    /// "10.0.0.10:8080" or "unix:/run/app.sock"
    pub addr: String,
    pub weight: i64,
    pub is_backup: bool,
}

#[derive(Clone, Debug)]
pub struct ProxyCfg {
    pub lb: String,
    pub targets: Vec<UpstreamTarget>,
    pub websockets: bool,
    pub pass_host: bool,

    pub time_connect: String,
    pub time_read: String,
    pub time_send: String,

    pub microcache: CacheCfg,
    pub static_cache: CacheCfg,
}

/// Mode-specific render input; the pipeline dispatches once when it builds
/// this value.
#[derive(Clone, Debug)]
pub enum ModeCfg {
    Php(FastCgiCfg),
    Proxy(ProxyCfg),
    Static,
}

#[derive(Clone, Debug)]
pub struct SiteTemplateData {
    pub domain: String,
    pub webroot: PathBuf,
    pub acme_webroot: PathBuf,
    pub enable_http3: bool,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub front_controller: bool,

    pub access_log: PathBuf,
    pub error_log: PathBuf,

    pub mode: ModeCfg,
}

/// Identifier-safe key derived from the domain, shared by upstream names and
/// PHP-FPM socket/pool file names. `.` and `-` map to `_`; any other run of
/// non-identifier characters collapses to a single `_`.
pub fn domain_key(domain: &str) -> String {
    let lowered = domain.trim().to_ascii_lowercase().replace(['.', '-'], "_");

    let mut out = String::with_capacity(lowered.len());
    let mut in_run = false;
    for ch in lowered.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }

    let out = out.trim_matches('_');
    if out.is_empty() {
        "site".to_string()
    } else {
        out.to_string()
    }
}

/// Renders the full vhost for one site. Validates required fields first and
/// returns the exact bytes the caller stages and hashes.
pub fn render_site(site: &SiteTemplateData) -> anyhow::Result<Vec<u8>> {
    if site.domain.trim().is_empty() {
        anyhow::bail!("site domain is required");
    }
    if site.acme_webroot.as_os_str().is_empty() {
        anyhow::bail!("site acme webroot is required");
    }
    if site.webroot.as_os_str().is_empty() {
        anyhow::bail!("site webroot is required");
    }
    if site.tls_cert.as_os_str().is_empty() || site.tls_key.as_os_str().is_empty() {
        anyhow::bail!("site tls cert/key are required");
    }
    if let ModeCfg::Php(php) = &site.mode
        && php.pass.is_empty()
    {
        anyhow::bail!("php fastcgi pass is required");
    }

    let key = domain_key(&site.domain);
    let upstream = format!("{key}_upstream");

    let mut w = String::with_capacity(4096);
    let out = &mut w;

    writeln!(out, "# Managed by ngm. Do not edit: regenerated on apply.")?;
    writeln!(out)?;

    // Port 80: ACME challenges stay on HTTP, everything else redirects.
    writeln!(out, "server {{")?;
    writeln!(out, "    listen 80;")?;
    writeln!(out, "    listen [::]:80;")?;
    writeln!(out, "    server_name {};", site.domain)?;
    writeln!(out)?;
    writeln!(out, "    location ^~ /.well-known/acme-challenge/ {{")?;
    writeln!(out, "        root {};", site.acme_webroot.display())?;
    writeln!(out, "        default_type text/plain;")?;
    writeln!(out, "    }}")?;
    writeln!(out)?;
    writeln!(out, "    location / {{")?;
    writeln!(out, "        return 301 https://$host$request_uri;")?;
    writeln!(out, "    }}")?;
    writeln!(out, "}}")?;
    writeln!(out)?;

    if let ModeCfg::Proxy(proxy) = &site.mode {
        writeln!(out, "upstream {upstream} {{")?;
        if !proxy.lb.is_empty() {
            writeln!(out, "    {};", proxy.lb)?;
        }
        for t in &proxy.targets {
            let backup = if t.is_backup { " backup" } else { "" };
            writeln!(out, "    server {} weight={}{};", t.addr, t.weight, backup)?;
        }
        writeln!(out, "    keepalive 16;")?;
        writeln!(out, "}}")?;
        writeln!(out)?;
    }

    writeln!(out, "server {{")?;
    writeln!(out, "    listen 443 ssl;")?;
    writeln!(out, "    listen [::]:443 ssl;")?;
    writeln!(out, "    http2 on;")?;
    if site.enable_http3 {
        writeln!(out, "    listen 443 quic;")?;
        writeln!(out, "    listen [::]:443 quic;")?;
    }
    writeln!(out, "    server_name {};", site.domain)?;
    writeln!(out)?;
    writeln!(out, "    ssl_certificate {};", site.tls_cert.display())?;
    writeln!(out, "    ssl_certificate_key {};", site.tls_key.display())?;
    if site.enable_http3 {
        writeln!(out, "    add_header Alt-Svc 'h3=\":443\"; ma=86400' always;")?;
    }
    writeln!(out)?;
    writeln!(out, "    access_log {};", site.access_log.display())?;
    writeln!(out, "    error_log {};", site.error_log.display())?;
    writeln!(out)?;
    writeln!(out, "    root {};", site.webroot.display())?;
    writeln!(out)?;
    writeln!(out, "    location ^~ /.well-known/acme-challenge/ {{")?;
    writeln!(out, "        root {};", site.acme_webroot.display())?;
    writeln!(out, "        default_type text/plain;")?;
    writeln!(out, "    }}")?;
    writeln!(out)?;

    match &site.mode {
        ModeCfg::Php(php) => {
            writeln!(out, "    index index.php index.html;")?;
            writeln!(out)?;
            writeln!(out, "    location / {{")?;
            if site.front_controller {
                writeln!(out, "        try_files $uri $uri/ /index.php?$query_string;")?;
            } else {
                writeln!(out, "        try_files $uri $uri/ =404;")?;
            }
            writeln!(out, "    }}")?;
            writeln!(out)?;
            writeln!(out, "    location ~ \\.php$ {{")?;
            writeln!(out, "        try_files $uri =404;")?;
            writeln!(out, "        include fastcgi_params;")?;
            writeln!(out, "        fastcgi_split_path_info ^(.+\\.php)(/.+)$;")?;
            writeln!(
                out,
                "        fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;"
            )?;
            writeln!(out, "        fastcgi_index index.php;")?;
            writeln!(out, "        fastcgi_pass {};", php.pass)?;
            if php.cache.enabled {
                writeln!(out, "        fastcgi_cache {};", php.cache.zone)?;
                writeln!(out, "        fastcgi_cache_valid 200 {};", php.cache.ttl_200)?;
            }
            writeln!(out, "    }}")?;
        }
        ModeCfg::Proxy(proxy) => {
            writeln!(out, "    index index.html;")?;
            writeln!(out)?;
            writeln!(out, "    location / {{")?;
            writeln!(out, "        proxy_pass http://{upstream};")?;
            writeln!(out, "        proxy_http_version 1.1;")?;
            if proxy.pass_host {
                writeln!(out, "        proxy_set_header Host $host;")?;
            }
            writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;")?;
            writeln!(
                out,
                "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
            )?;
            writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;")?;
            writeln!(out, "        proxy_connect_timeout {};", proxy.time_connect)?;
            writeln!(out, "        proxy_read_timeout {};", proxy.time_read)?;
            writeln!(out, "        proxy_send_timeout {};", proxy.time_send)?;
            if proxy.websockets {
                writeln!(out, "        proxy_set_header Upgrade $http_upgrade;")?;
                writeln!(out, "        proxy_set_header Connection \"upgrade\";")?;
            }
            if proxy.microcache.enabled {
                writeln!(out, "        proxy_cache {};", proxy.microcache.zone)?;
                writeln!(
                    out,
                    "        proxy_cache_valid 200 {};",
                    proxy.microcache.ttl_200
                )?;
                writeln!(out, "        proxy_cache_use_stale updating;")?;
            }
            writeln!(out, "    }}")?;
            if proxy.static_cache.enabled {
                writeln!(out)?;
                writeln!(
                    out,
                    "    location ~* \\.(?:css|js|mjs|png|jpe?g|gif|ico|svg|webp|woff2?)$ {{"
                )?;
                writeln!(out, "        proxy_pass http://{upstream};")?;
                if proxy.pass_host {
                    writeln!(out, "        proxy_set_header Host $host;")?;
                }
                writeln!(out, "        proxy_cache {};", proxy.static_cache.zone)?;
                writeln!(
                    out,
                    "        proxy_cache_valid 200 {};",
                    proxy.static_cache.ttl_200
                )?;
                writeln!(out, "    }}")?;
            }
        }
        ModeCfg::Static => {
            writeln!(out, "    index index.html;")?;
            writeln!(out)?;
            writeln!(out, "    location / {{")?;
            writeln!(out, "        try_files $uri $uri/ =404;")?;
            writeln!(out, "    }}")?;
        }
    }

    writeln!(out, "}}")?;

    Ok(w.into_bytes())
}
