use tracing_subscriber::{fmt, EnvFilter};

/// Initialize dotenv and structured tracing based on RUST_LOG.
///
/// Environment files are discovered in order: an explicit ENV_FILE /
/// DOTENV_PATH, then ./.env. Existing process variables are never
/// overwritten by dotenv.
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }
    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("environment loaded from: {}", env_source);
}

/// Build the outbound HTTP client honoring proxy and timeout variables.
///
/// Environment:
/// - SESSIONBRIDGE_NO_PROXY = 1|true|yes|on  -> disable all proxies
/// - SESSIONBRIDGE_PROXY_URL = <url>         -> proxy for all schemes
/// - HTTP_PROXY / HTTPS_PROXY                -> scheme-specific proxies
/// - SESSIONBRIDGE_HTTP_TIMEOUT_SECONDS      -> overall request timeout
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if let Ok(secs) = std::env::var("SESSIONBRIDGE_HTTP_TIMEOUT_SECONDS") {
        if let Ok(n) = secs.trim().parse::<u64>() {
            builder = builder.timeout(std::time::Duration::from_secs(n));
        }
    }

    let no_proxy = std::env::var("SESSIONBRIDGE_NO_PROXY")
        .map(|v| v.trim().to_ascii_lowercase())
        .map(|v| v == "1" || v == "true" || v == "yes" || v == "on")
        .unwrap_or(false);

    if no_proxy {
        builder = builder.no_proxy();
    } else {
        if let Ok(url) = std::env::var("SESSIONBRIDGE_PROXY_URL") {
            let u = url.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::all(u) {
                    builder = builder.proxy(p);
                }
            }
        }
        if let Ok(http_p) = std::env::var("HTTP_PROXY").or_else(|_| std::env::var("http_proxy")) {
            let u = http_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::http(u) {
                    builder = builder.proxy(p);
                }
            }
        }
        if let Ok(https_p) = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("https_proxy"))
        {
            let u = https_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::https(u) {
                    builder = builder.proxy(p);
                }
            }
        }
    }

    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Build a CORS configuration from environment variables.
///
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins
/// - CORS_ALLOWED_METHODS: "*" or comma-separated methods
/// - CORS_ALLOWED_HEADERS: "*" or comma-separated header names
///
/// Defaults are permissive: browser clients talk to the gateway directly.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    if let Ok(origins) = std::env::var("CORS_ALLOWED_ORIGINS") {
        let s = origins.trim();
        if s == "*" {
            cors = cors.allow_any_origin();
        } else {
            for part in s.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_origin(p);
                }
            }
        }
    } else {
        cors = cors.allow_any_origin();
    }

    if let Ok(methods) = std::env::var("CORS_ALLOWED_METHODS") {
        let s = methods.trim();
        if s == "*" {
            cors = cors.allow_any_method();
        } else {
            let methods: Vec<&str> = s
                .split(',')
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .collect();
            if !methods.is_empty() {
                cors = cors.allowed_methods(methods);
            }
        }
    } else {
        cors = cors.allow_any_method();
    }

    if let Ok(headers) = std::env::var("CORS_ALLOWED_HEADERS") {
        let s = headers.trim();
        if s == "*" {
            cors = cors.allow_any_header();
        } else {
            for part in s.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_header(p);
                }
            }
        }
    } else {
        cors = cors.allow_any_header();
    }

    cors
}
