//! Individual doctor checks: config file validity plus LLM/STT/TTS
//! reachability, mirroring the probes `server::http::health_handler`
//! already runs for `GET /health` but reported for a human at the CLI.

use crate::config::Config;

pub struct CheckResult {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

pub struct Report {
    pub checks: Vec<CheckResult>,
}

pub async fn run_all_checks() -> Report {
    let mut checks = vec![check_config()];

    match Config::load() {
        Ok(config) => {
            checks.push(check_llm_api_key(&config));
            let client = reqwest::Client::new();
            let (llm, stt, tts) = tokio::join!(
                probe("llm", &client, &config.llm.base_url),
                probe("stt", &client, &config.stt.base_url),
                probe("tts", &client, &config.tts.base_url),
            );
            checks.push(llm);
            checks.push(stt);
            checks.push(tts);
        }
        Err(e) => {
            checks.push(CheckResult {
                name: "adapters",
                ok: false,
                detail: format!("skipped: config failed to load ({e})"),
            });
        }
    }

    Report { checks }
}

fn check_config() -> CheckResult {
    match Config::load() {
        Ok(_) => match crate::config::config_path() {
            Ok(path) => CheckResult {
                name: "config",
                ok: true,
                detail: format!("loaded from {}", path.display()),
            },
            Err(_) => CheckResult {
                name: "config",
                ok: true,
                detail: "loaded (using defaults)".to_string(),
            },
        },
        Err(e) => CheckResult {
            name: "config",
            ok: false,
            detail: format!("failed to load: {e}"),
        },
    }
}

/// Not every LLM backend requires a key (a local Ollama server doesn't),
/// so a missing key is reported rather than failed outright.
fn check_llm_api_key(config: &Config) -> CheckResult {
    let configured = crate::security::has_credential("llm-api-key") || config.llm.api_key.is_some();
    CheckResult {
        name: "llm_api_key",
        ok: true,
        detail: if configured {
            "configured".to_string()
        } else {
            "not set (fine for backends that don't require one, e.g. local Ollama)".to_string()
        },
    }
}

async fn probe(name: &'static str, client: &reqwest::Client, base_url: &str) -> CheckResult {
    match client.get(base_url).send().await {
        Ok(resp) if resp.status().is_success() || resp.status().is_client_error() => CheckResult {
            name,
            ok: true,
            detail: format!("reachable at {base_url}"),
        },
        Ok(resp) => CheckResult {
            name,
            ok: false,
            detail: format!("{base_url} responded with {}", resp.status()),
        },
        Err(e) => CheckResult {
            name,
            ok: false,
            detail: format!("unreachable at {base_url} ({e})"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_reports_unreachable_for_a_closed_port() {
        let client = reqwest::Client::new();
        let result = probe("test", &client, "http://127.0.0.1:1").await;
        assert!(!result.ok);
    }
}
