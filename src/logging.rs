//! Tracing subscriber setup

use crate::config::Environment;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset. PDF parsing crates are noisy at
/// info level on scanned documents, so they only report warnings.
fn default_directives(env: &Environment) -> &'static str {
    match env {
        Environment::Dev => {
            "ndiah_backend=debug,tower_http=debug,sqlx=warn,pdf_extract=warn,lopdf=warn,info"
        }
        Environment::Staging => {
            "ndiah_backend=debug,tower_http=info,sqlx=warn,pdf_extract=warn,lopdf=warn,info"
        }
        Environment::Prod => "ndiah_backend=info,tower_http=info,pdf_extract=error,lopdf=error,warn",
    }
}

fn uses_json_output(env: &Environment) -> bool {
    matches!(env, Environment::Prod)
}

pub fn init_logging(env: &Environment) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(env)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(env.is_dev())
        .with_line_number(env.is_dev());

    // JSON in production, pretty output elsewhere
    let registry = tracing_subscriber::registry().with(filter);
    if uses_json_output(env) {
        registry.with(fmt_layer.json().flatten_event(true)).init();
    } else {
        registry.with(fmt_layer.pretty()).init();
    }

    tracing::info!(env = ?env, "Logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_parse() {
        for env in [Environment::Dev, Environment::Staging, Environment::Prod] {
            EnvFilter::try_new(default_directives(&env)).unwrap();
        }
    }

    #[test]
    fn only_production_logs_json() {
        assert!(!uses_json_output(&Environment::Dev));
        assert!(!uses_json_output(&Environment::Staging));
        assert!(uses_json_output(&Environment::Prod));
    }
}
