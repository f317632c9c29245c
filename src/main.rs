//! Live presentation server binary.

use std::env;
use std::net::TcpListener;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use podium::command::intent::{ChatIntentClassifier, IntentClassifier, NullClassifier};
use podium::presentations::{
    Authenticator, HttpPresentationStore, InMemoryPresentationStore, PresentationStore,
    TokenAuthenticator,
};
use podium::server::{run_server, ServerContext};
use podium::session::SessionManager;
use podium::stt::{DeepgramStt, SpeechToText};
use podium::Settings;

fn init_logging() {
    let env_filter = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    init_logging();
    let settings = Settings::from_env();

    let api_key = settings
        .deepgram_api_key
        .clone()
        .context("PODIUM_DEEPGRAM_API_KEY is required")?;
    let stt: Arc<dyn SpeechToText> = Arc::new(DeepgramStt::new(&api_key, &settings.deepgram_model));

    let classifier: Arc<dyn IntentClassifier> = match settings.intent_api_key.as_deref() {
        Some(key) => Arc::new(ChatIntentClassifier::new(
            &settings.intent_endpoint,
            key,
            &settings.intent_model,
            settings.classifier_timeout,
        )),
        None => {
            warn!("no intent API key set, semantic classification disabled");
            Arc::new(NullClassifier)
        }
    };

    let presentations: Arc<dyn PresentationStore> = match settings.presentation_api.as_deref() {
        Some(api) => Arc::new(HttpPresentationStore::new(api)),
        None => {
            if settings.presentation_seed.is_empty() {
                warn!("no presentation API or seed configured; every lookup will fail");
            }
            Arc::new(InMemoryPresentationStore::from_seed(
                &settings.presentation_seed,
            ))
        }
    };

    let auth: Arc<dyn Authenticator> =
        Arc::new(TokenAuthenticator::new(settings.auth_api.clone()));
    let sessions = SessionManager::new(Arc::clone(&presentations));

    let listener = TcpListener::bind(&settings.bind_addr)
        .with_context(|| format!("bind {}", settings.bind_addr))?;
    info!("podium server starting on {}", settings.bind_addr);

    let context = Arc::new(ServerContext {
        settings,
        stt,
        classifier,
        auth,
        presentations,
        sessions,
    });
    run_server(listener, context)
}
