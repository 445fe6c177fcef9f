use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use serde_json::Value;
use tokio::{net::TcpListener, time::MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use relaynode_common::{
    command::DEFAULT_USER, ActivationRequest, BatchOutcome, Clock, CommandError,
    CommandProcessor, ConfigureOutcome, Dispatched, NetworkConfig, PlatformRequest, RelayController,
    RelayError, RuntimeConfig, SafetyConfig, Topics, ValidationError,
};

use crate::{
    adapters::{MqttPublisher, SimulatedOutputs, SystemClock},
    store::AppStore,
};

#[derive(Clone)]
struct AppState {
    controller: Arc<RelayController>,
    processor: Arc<CommandProcessor>,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChannelFailure {
    channel: u8,
    kind: &'static str,
    error: String,
}

#[derive(Debug, Serialize)]
struct RelayResponse {
    succeeded: usize,
    skipped: Vec<u8>,
    failed: Vec<ChannelFailure>,
}

impl From<BatchOutcome> for RelayResponse {
    fn from(outcome: BatchOutcome) -> Self {
        let failed = outcome
            .results
            .iter()
            .filter_map(|(channel, result)| {
                result.as_ref().err().map(|err| ChannelFailure {
                    channel: *channel,
                    kind: err.kind(),
                    error: err.to_string(),
                })
            })
            .collect();
        Self {
            succeeded: outcome.succeeded,
            skipped: outcome.skipped,
            failed,
        }
    }
}

#[derive(Debug, Serialize)]
struct EmergencyStopResponse {
    #[serde(rename = "switchedOff")]
    switched_off: usize,
}

#[derive(Debug, Serialize)]
struct EmergencyResetResponse {
    #[serde(rename = "wasActive")]
    was_active: bool,
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    applied: usize,
    deferred: usize,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    if let Err(err) = runtime.validate() {
        warn!("stored channel table rejected ({err}); using defaults");
        runtime.channels = RuntimeConfig::default().channels;
    }
    apply_env_overrides(&mut runtime.network);

    let mut mqtt_options = MqttOptions::new(
        runtime.network.device_id.clone(),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let clock = Arc::new(SystemClock::new(&runtime.timezone));
    let topics = Topics::new(&runtime.network.topic_prefix, &runtime.network.device_id);
    let controller = Arc::new(
        RelayController::new(
            runtime.channels.clone(),
            &runtime.safety,
            topics,
            Arc::new(SimulatedOutputs::default()),
            Arc::new(MqttPublisher::new(mqtt.clone())),
            clock.clone(),
        )
        .context("failed to initialize relay controller")?,
    );
    info!(
        channels = controller.channel_count(),
        timezone = %clock.timezone(),
        heartbeat_timeout_ms = controller.heartbeat_timeout_ms(),
        "relay node starting"
    );

    if runtime.restore_states_on_boot {
        match store.load_channel_states().await {
            Ok(states) => {
                let restored = controller.restore_states(&states);
                info!(restored, "channel states restored");
            }
            Err(err) => warn!("failed to load channel states: {err:#}"),
        }
    }

    let app_state = AppState {
        processor: Arc::new(CommandProcessor::new(controller.clone())),
        controller,
        mqtt,
        store,
    };

    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_safety_loop(app_state.controller.clone(), clock, &runtime.safety);
    spawn_state_publish_loop(app_state.clone(), &runtime.safety);
    spawn_state_save_loop(app_state.clone(), &runtime.safety);

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/relays/reset", post(handle_reset_relays))
        .route("/api/relays/{channel}", post(handle_set_relay))
        .route("/api/emergency-stop", post(handle_emergency_stop))
        .route("/api/emergency-stop/reset", post(handle_emergency_reset))
        .route("/api/config/reload", post(handle_reload_config))
        .with_state(app_state.clone());

    let port = std::env::var("RELAYNODE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shut_down(&app_state).await;
    Ok(())
}

fn apply_env_overrides(network: &mut NetworkConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}

fn subscribe_topics(mqtt: &AsyncClient, topics: &Topics) {
    for topic in topics.subscriptions() {
        if let Err(err) = mqtt.try_subscribe(topic, QoS::AtLeastOnce) {
            warn!("subscribe to {topic} failed: {err}");
        }
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&app_state, &message.topic, &message.payload);
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    subscribe_topics(&app_state.mqtt, app_state.controller.topics());
                    app_state.controller.publish_status();
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) {
    // Rejections are already logged and reported on the error topic.
    let Ok(dispatched) = app_state.processor.handle(topic, payload) else {
        return;
    };
    debug!(topic, ?dispatched, "mqtt command handled");
    if let Dispatched::Platform(request) = dispatched {
        tokio::spawn(handle_platform_request(app_state.clone(), request));
    }
}

async fn handle_platform_request(app_state: AppState, request: PlatformRequest) {
    match request {
        PlatformRequest::Reboot { delay_s } => {
            warn!(delay_s, "reboot requested; host builds cannot reboot");
        }
        PlatformRequest::Ota { url } => {
            warn!(url = url.as_str(), "OTA update requested; only available on device builds");
        }
        PlatformRequest::ResetConfig => {
            if let Err(err) = reset_config(&app_state).await {
                warn!("configuration reset failed: {err:#}");
            }
        }
    }
}

/// Restores default channel and safety settings; network settings are kept.
async fn reset_config(app_state: &AppState) -> anyhow::Result<()> {
    let defaults = RuntimeConfig::default();
    let mut runtime = app_state.store.load_runtime_config().await?;
    runtime.channels = defaults.channels;
    runtime.safety = defaults.safety;
    runtime.restore_states_on_boot = defaults.restore_states_on_boot;
    app_state.store.save_runtime_config(&runtime).await?;

    let outcomes = app_state
        .controller
        .reconfigure(runtime.channels)
        .context("saved defaults; restart required to apply them")?;
    let (applied, deferred) = count_outcomes(&outcomes);
    info!(applied, deferred, "configuration reset to defaults");
    Ok(())
}

fn spawn_safety_loop(
    controller: Arc<RelayController>,
    clock: Arc<SystemClock>,
    safety: &SafetyConfig,
) {
    let period = Duration::from_millis(safety.sweep_interval_ms);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let report = controller.tick(clock.now());
            if report.shutoffs > 0 {
                info!(shutoffs = report.shutoffs, "safety sweep switched channels off");
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState, safety: &SafetyConfig) {
    let period = Duration::from_millis(safety.status_publish_interval_ms);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            app_state.controller.publish_status();
        }
    });
}

fn spawn_state_save_loop(app_state: AppState, safety: &SafetyConfig) {
    let period = Duration::from_millis(safety.state_save_debounce_ms);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !app_state.controller.take_states_dirty() {
                continue;
            }
            let states = app_state.controller.channel_states();
            if let Err(err) = app_state.store.save_channel_states(&states).await {
                warn!("failed to persist channel states: {err:#}");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Persists the live states for the next boot, then drives every output off.
async fn shut_down(app_state: &AppState) {
    let states = app_state.controller.channel_states();
    if let Err(err) = app_state.store.save_channel_states(&states).await {
        warn!("failed to persist channel states: {err:#}");
    }
    app_state
        .controller
        .reset_channels(&ActivationRequest::system("shutdown"));
    info!("all channels off; controller stopped");
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.status())
}

async fn handle_set_relay(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Json(body): Json<Value>,
) -> axum::response::Response {
    let route = format!("POST /api/relays/{channel}");
    let payload = match body {
        Value::Object(mut fields) => {
            let channel = match channel.parse::<u64>() {
                Ok(id) => Value::from(id),
                Err(_) => Value::String(channel),
            };
            fields.insert("channel".to_string(), channel);
            fields
                .entry("source")
                .or_insert_with(|| Value::String("http".to_string()));
            Value::Object(fields)
        }
        other => other,
    };

    match state.processor.handle_relay(&route, payload) {
        Ok(Dispatched::Relay(outcome)) => Json(RelayResponse::from(outcome)).into_response(),
        Ok(other) => {
            debug!(?other, "unexpected dispatch result for relay command");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => command_error_response(&err),
    }
}

async fn handle_emergency_stop(State(state): State<AppState>) -> impl IntoResponse {
    let switched_off = state
        .controller
        .emergency_stop(&ActivationRequest::new(DEFAULT_USER, "http"));
    Json(EmergencyStopResponse { switched_off })
}

async fn handle_emergency_reset(State(state): State<AppState>) -> impl IntoResponse {
    let was_active = state
        .controller
        .reset_emergency_stop(&ActivationRequest::new(DEFAULT_USER, "http"));
    Json(EmergencyResetResponse { was_active })
}

async fn handle_reset_relays(State(state): State<AppState>) -> impl IntoResponse {
    state
        .controller
        .reset_channels(&ActivationRequest::new(DEFAULT_USER, "http"));
    Json(state.controller.status())
}

async fn handle_reload_config(State(state): State<AppState>) -> axum::response::Response {
    let channels = match state.store.load_channels().await {
        Ok(channels) => channels,
        Err(err) => {
            warn!("config reload failed: {err:#}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_unreadable",
                &format!("{err:#}"),
            );
        }
    };
    match state.controller.reconfigure(channels) {
        Ok(outcomes) => {
            let (applied, deferred) = count_outcomes(&outcomes);
            info!(applied, deferred, "channel configuration reloaded");
            Json(ReloadResponse { applied, deferred }).into_response()
        }
        Err(err) => error_response(StatusCode::CONFLICT, "restart_required", &err.to_string()),
    }
}

fn count_outcomes(outcomes: &[ConfigureOutcome]) -> (usize, usize) {
    let deferred = outcomes
        .iter()
        .filter(|outcome| **outcome == ConfigureOutcome::Deferred)
        .count();
    (outcomes.len() - deferred, deferred)
}

fn status_for(err: &CommandError) -> StatusCode {
    match err {
        CommandError::Validation(ValidationError::InvalidChannel)
        | CommandError::Relay(RelayError::InvalidChannel(_)) => StatusCode::NOT_FOUND,
        CommandError::Validation(_) | CommandError::Relay(RelayError::MomentaryRequiresChannel) => {
            StatusCode::BAD_REQUEST
        }
        CommandError::Relay(RelayError::Denied(_)) => StatusCode::FORBIDDEN,
        CommandError::Relay(RelayError::EmergencyStopActive) => StatusCode::CONFLICT,
    }
}

fn command_error_response(err: &CommandError) -> axum::response::Response {
    error_response(status_for(err), err.kind(), &err.to_string())
}

fn error_response(
    status: StatusCode,
    kind: &'static str,
    message: &str,
) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
            kind,
        }),
    )
        .into_response()
}
