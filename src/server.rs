/*!
 # HTTP API

 Thin routes over the engine boundary and the shared schedule. Manual
 triggers go through the same run-state guard as the scheduler, so a busy
 strip answers `409 Conflict`.
*/

use std::future::Future;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::engine::{AnimationEngine, Trigger};
use crate::guard::RunKind;
use crate::schedule::{DaySchedule, ScheduleEvaluator, ScheduleStore, SharedSchedule};
use crate::Result;

/// State shared by every handler
#[derive(Debug, Clone)]
pub struct AppState {
    engine: AnimationEngine,
    schedule: SharedSchedule,
    store: Option<ScheduleStore>,
}

impl AppState {
    /// Bundles the engine with the schedule and, optionally, where to persist it
    pub fn new(engine: AnimationEngine, schedule: SharedSchedule, store: Option<ScheduleStore>) -> Self {
        Self {
            engine,
            schedule,
            store,
        }
    }
}

/// Body of `GET /api/status`
#[derive(Debug, Serialize)]
struct Status {
    running: bool,
    alarm: bool,
}

/// Body of `POST /api/cancel`
#[derive(Debug, Serialize)]
struct Cancelled {
    cancelled: bool,
}

/// Builds the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/schedules", get(list_schedules))
        .route("/api/schedules/save", post(save_schedules))
        .route("/api/test-lights", post(test_lights))
        .route("/api/sunrise-alarm", post(sunrise_alarm))
        .route("/api/cancel", post(cancel))
        .route("/api/status", get(status))
        .with_state(state)
}

/// Serves the API until `shutdown` fires
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP API listening on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Runs the schedule evaluator next to the API until `stop` resolves
///
/// Both tasks are spawned only once the listener is bound. If the server
/// stops on its own the evaluator is shut down as well.
#[instrument(skip_all)]
pub async fn run_daemon(
    state: AppState,
    listener: TcpListener,
    tick: Duration,
    stop: impl Future<Output = ()>,
) -> Result<()> {
    let shutdown = CancellationToken::new();
    let engine = state.engine.clone();
    let evaluator = ScheduleEvaluator::new(engine.clone(), state.schedule.clone());
    let evaluator_task = tokio::spawn(evaluator.run(tick, shutdown.clone()));
    let mut server_task = tokio::spawn(serve(listener, state, shutdown.clone()));

    let finished_early = tokio::select! {
        result = &mut server_task => {
            error!("HTTP API stopped unexpectedly");
            Some(result)
        }
        _ = stop => None,
    };

    shutdown.cancel();
    engine.cancel_running();
    evaluator_task.await?;

    let server_result = match finished_early {
        Some(result) => result,
        None => server_task.await,
    };
    server_result?
}

async fn list_schedules(State(state): State<AppState>) -> Json<Vec<DaySchedule>> {
    Json(state.schedule.read().days())
}

async fn save_schedules(
    State(state): State<AppState>,
    Json(days): Json<Vec<DaySchedule>>,
) -> StatusCode {
    let snapshot = {
        let mut schedule = state.schedule.write();
        if let Err(e) = schedule.update(days) {
            warn!("Rejected schedule update: {}", e);
            return StatusCode::BAD_REQUEST;
        }
        schedule.clone()
    };

    if let Some(store) = &state.store {
        if let Err(e) = store.save(&snapshot) {
            error!("Failed to save schedule to {}: {}", store.path().display(), e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    info!("Schedule updated");
    StatusCode::OK
}

fn trigger_status(trigger: Trigger) -> StatusCode {
    match trigger {
        Trigger::Accepted(_) => StatusCode::ACCEPTED,
        Trigger::Busy => StatusCode::CONFLICT,
    }
}

async fn test_lights(State(state): State<AppState>) -> StatusCode {
    info!("Got a request to test the lights");
    trigger_status(state.engine.trigger_test())
}

async fn sunrise_alarm(State(state): State<AppState>) -> StatusCode {
    info!("Got a request to start the sunrise alarm");
    trigger_status(state.engine.trigger_alarm())
}

async fn cancel(State(state): State<AppState>) -> Json<Cancelled> {
    Json(Cancelled {
        cancelled: state.engine.cancel_running(),
    })
}

async fn status(State(state): State<AppState>) -> Json<Status> {
    let kind = state.engine.guard().running_kind();
    Json(Status {
        running: kind.is_some(),
        alarm: kind == Some(RunKind::Alarm),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use parking_lot::RwLock;
    use tower::ServiceExt;

    use super::*;
    use crate::config::EngineConfig;
    use crate::device::MemoryStrip;
    use crate::guard::RunStateGuard;
    use crate::schedule::WeekSchedule;
    use crate::weather::NoRain;

    fn app() -> (Router, AnimationEngine, SharedSchedule) {
        let mut config = EngineConfig::default();
        config.device.led_count = 10;
        let engine = AnimationEngine::new(
            Box::new(MemoryStrip::new(10)),
            config,
            RunStateGuard::new(),
            Arc::new(NoRain),
        )
        .unwrap();
        let schedule = Arc::new(RwLock::new(WeekSchedule::default()));
        let state = AppState::new(engine.clone(), schedule.clone(), None);
        (router(state), engine, schedule)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn second_trigger_conflicts() {
        let (app, engine, _) = app();

        let (status, _) = send(&app, "POST", "/api/test-lights", Body::empty()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _) = send(&app, "POST", "/api/sunrise-alarm", Body::empty()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = send(&app, "GET", "/api/status", Body::empty()).await;
        assert_eq!(body, r#"{"running":true,"alarm":false}"#);

        let (_, body) = send(&app, "POST", "/api/cancel", Body::empty()).await;
        assert_eq!(body, r#"{"cancelled":true}"#);

        while engine.is_running() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let (_, body) = send(&app, "POST", "/api/cancel", Body::empty()).await;
        assert_eq!(body, r#"{"cancelled":false}"#);
    }

    #[tokio::test]
    async fn daemon_stops_the_evaluator_and_its_alarm() {
        let (_, engine, schedule) = app();
        {
            let mut schedule = schedule.write();
            let all_day = crate::schedule::WEEK_DAYS
                .iter()
                .map(|day| DaySchedule::new(*day, 0, crate::schedule::MINUTES_PER_DAY, true));
            schedule.update(all_day).unwrap();
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let state = AppState::new(engine.clone(), schedule, None);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let daemon = tokio::spawn(run_daemon(
            state,
            listener,
            Duration::from_millis(10),
            async move {
                let _ = stop_rx.await;
            },
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.guard().running_kind() != Some(RunKind::Alarm) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("evaluator never started the alarm");

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), daemon)
            .await
            .expect("daemon did not stop")
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("alarm kept running after shutdown");
    }

    #[tokio::test]
    async fn schedules_can_be_listed_and_saved() {
        let (app, _, schedule) = app();

        let (status, body) = send(&app, "GET", "/api/schedules", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let days: Vec<DaySchedule> = serde_json::from_str(&body).unwrap();
        assert_eq!(days.len(), 7);
        assert_eq!(days[0].day, "Monday");

        let update = r#"[{"day": "Sunday", "start": 540, "end": 600, "enabled": false}]"#;
        let (status, _) = send(&app, "POST", "/api/schedules/save", Body::from(update)).await;
        assert_eq!(status, StatusCode::OK);
        let sunday = schedule.read().get(chrono::Weekday::Sun).cloned().unwrap();
        assert_eq!((sunday.start, sunday.end, sunday.enabled), (540, 600, false));

        let bad = r#"[{"day": "Someday", "start": 540, "end": 600, "enabled": true}]"#;
        let (status, _) = send(&app, "POST", "/api/schedules/save", Body::from(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
