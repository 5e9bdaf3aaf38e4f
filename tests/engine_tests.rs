//! Integration tests for the animation engine

mod common;
use common::*;

use std::sync::Arc;
use std::time::Duration;

use sunrise_alarm::{
    AnimationError, AnimationRequest, EngineConfig, FixedRain, NoRain, RunKind, RunOutcome,
    Trigger, BLACK, BLUE, RED, WHITE,
};
use tokio::time::Instant;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_accept_exactly_one() {
    let (engine, _strip) = engine_with(fast_config(10), Arc::new(NoRain));
    let barrier = Arc::new(tokio::sync::Barrier::new(16));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                if i % 2 == 0 {
                    engine.trigger_test()
                } else {
                    engine.trigger_alarm()
                }
            })
        })
        .collect();

    let mut accepted = Vec::new();
    for task in tasks {
        if let Trigger::Accepted(handle) = task.await.unwrap() {
            accepted.push(handle);
        }
    }
    assert_eq!(accepted.len(), 1);
    assert!(engine.is_running());
    assert!(!engine.trigger_test().is_accepted());

    assert!(engine.cancel_running());
    let handle = accepted.pop().unwrap();
    assert_eq!(handle.await.unwrap(), Ok(RunOutcome::Cancelled));
    assert!(!engine.is_running());

    let next = engine.trigger(AnimationRequest::Clear).into_handle().unwrap();
    assert_eq!(next.await.unwrap(), Ok(RunOutcome::Completed));
}

#[tokio::test(start_paused = true)]
async fn idle_cancel_does_not_leak_into_next_alarm() {
    let (engine, strip) = engine_with(fast_config(30), Arc::new(NoRain));

    assert!(!engine.cancel_running());
    let handle = engine.trigger_alarm().into_handle().unwrap();
    assert_eq!(handle.await.unwrap(), Ok(RunOutcome::Completed));

    let mut levels: Vec<u8> = strip.frames().iter().map(|f| f.brightness).collect();
    levels.dedup();
    assert_eq!(
        levels,
        vec![0, 25, 50, 75, 100, 125, 150, 175, 200, 225, 250, 0]
    );
    assert_eq!(strip.brightness_level(), 0);
    assert!(strip.pixels().iter().all(|p| *p == WHITE));
}

#[tokio::test(start_paused = true)]
async fn sunrise_ramp_holds_each_step() {
    let (engine, strip) = engine_with(fast_config(5), Arc::new(NoRain));
    let started = Instant::now();
    engine.trigger_alarm().into_handle().unwrap().await.unwrap().unwrap();

    // Ten steps of ten seconds, then a minute at full brightness
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(160) && elapsed < Duration::from_secs(161));
    let step_frames: Vec<_> = strip
        .frames()
        .into_iter()
        .filter(|f| f.brightness > 0)
        .collect();
    assert_eq!(step_frames.len(), 10);
    for pair in step_frames.windows(2) {
        let gap = pair[1].at - pair[0].at;
        assert!(gap >= Duration::from_secs(10) && gap < Duration::from_millis(10_100));
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_sunrise_goes_dark_within_one_poll_interval() {
    let config = EngineConfig {
        device: sunrise_alarm::DeviceConfig {
            led_count: 30,
            ..Default::default()
        },
        ..EngineConfig::default()
    };
    let poll = config.poll_interval;

    // Mid first step, mid ramp, and during the full-brightness hold
    for cancel_after in [
        Duration::from_millis(500),
        Duration::from_millis(250_500),
        Duration::from_millis(1_500_300),
    ] {
        let (engine, strip) = engine_with(config.clone(), Arc::new(NoRain));
        let handle = engine.trigger_alarm().into_handle().unwrap();

        tokio::time::sleep(cancel_after).await;
        let cancelled_at = Instant::now();
        assert!(engine.cancel_running());
        assert_eq!(handle.await.unwrap(), Ok(RunOutcome::Cancelled));

        let last = strip.last_frame().unwrap();
        assert_eq!(last.brightness, 0);
        assert!(last.at - cancelled_at <= poll, "went dark after {:?}", last.at - cancelled_at);
        assert!(!engine.is_running());
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_scan_leaves_earlier_pixels_black_and_later_ones_untouched() {
    let (engine, strip) = engine_with(fast_config(50), Arc::new(NoRain));
    let index = 17;

    let handle = engine
        .trigger(AnimationRequest::PixelScan(RED))
        .into_handle()
        .unwrap();
    // Pixel `index` is lit from 20*index ms to 20*(index+1) ms
    tokio::time::sleep(Duration::from_millis(20 * index as u64 + 10)).await;
    assert!(engine.cancel_running());
    assert_eq!(handle.await.unwrap(), Ok(RunOutcome::Cancelled));

    let pixels = strip.pixels();
    assert!(pixels[..index].iter().all(|p| *p == BLACK));
    for later in index + 1..50 {
        assert_eq!(strip.writes(later), 0, "pixel {} was written", later);
    }
}

#[tokio::test(start_paused = true)]
async fn scan_cancelled_before_start_writes_nothing() {
    let (engine, strip) = engine_with(fast_config(8), Arc::new(NoRain));
    let permit = engine.guard().try_acquire(RunKind::Pattern).granted().unwrap();
    assert!(engine.cancel_running());

    let outcome = engine.run(permit, AnimationRequest::PixelScan(RED)).await;
    assert_eq!(outcome, Ok(RunOutcome::Cancelled));
    assert!((0..8).all(|i| strip.writes(i) == 0));
    assert_eq!(strip.render_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn complete_scan_ends_dark() {
    let (engine, strip) = engine_with(fast_config(6), Arc::new(NoRain));
    let outcome = engine
        .trigger(AnimationRequest::PixelScan(RED))
        .into_handle()
        .unwrap()
        .await
        .unwrap();
    assert_eq!(outcome, Ok(RunOutcome::Completed));
    assert!(strip.pixels().iter().all(|p| *p == BLACK));
    // Every pixel lit once and cleared once
    assert_eq!(strip.render_count(), 12);
    assert!((0..6).all(|i| strip.writes(i) == 2));
}

#[tokio::test(start_paused = true)]
async fn rain_turns_the_tail_blue_during_sunrise() {
    let (engine, strip) = engine_with(fast_config(30), Arc::new(FixedRain(70)));
    let handle = engine.trigger_alarm().into_handle().unwrap();

    tokio::time::sleep(Duration::from_secs(15)).await;
    let pixels = strip.pixels();
    assert!(pixels[..10].iter().all(|p| *p == WHITE));
    assert!(pixels[10..].iter().all(|p| *p == BLUE));

    // The base fill went out before the overlay
    let frames = strip.frames();
    assert!(frames[0].pixels.iter().all(|p| *p == WHITE));

    engine.cancel_running();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn no_rain_keeps_the_base_color() {
    let (engine, strip) = engine_with(fast_config(30), Arc::new(FixedRain(0)));
    engine.trigger_alarm().into_handle().unwrap().await.unwrap().unwrap();
    assert!(strip
        .frames()
        .iter()
        .all(|f| f.pixels.iter().all(|p| *p == WHITE)));
}

#[tokio::test(start_paused = true)]
async fn late_forecast_is_discarded_after_cancel() {
    let rain = DelayedRain {
        delay: Duration::from_secs(3),
        probability: 80,
    };
    let (engine, strip) = engine_with(fast_config(30), Arc::new(rain));
    let handle = engine.trigger_alarm().into_handle().unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    engine.cancel_running();
    assert_eq!(handle.await.unwrap(), Ok(RunOutcome::Cancelled));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(strip.pixels().iter().all(|p| *p == WHITE));
    assert!(strip
        .frames()
        .iter()
        .all(|f| !f.pixels.contains(&BLUE)));
}

#[tokio::test(start_paused = true)]
async fn slow_forecast_does_not_delay_the_start() {
    let rain = DelayedRain {
        delay: Duration::from_secs(60),
        probability: 80,
    };
    let (engine, strip) = engine_with(fast_config(30), Arc::new(rain));
    let started = Instant::now();
    let handle = engine.trigger_alarm().into_handle().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let frames = strip.frames();
    assert_eq!(frames[0].at, started);
    assert_eq!(frames[1].brightness, 25);

    // The query times out after five seconds and the strip stays white
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(strip.pixels().iter().all(|p| *p == WHITE));

    engine.cancel_running();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn device_failure_in_sunrise_still_turns_brightness_off() {
    let (engine, strip) = engine_with(fast_config(10), Arc::new(NoRain));
    strip.fail_renders_after(3);

    let result = engine.trigger_alarm().into_handle().unwrap().await.unwrap();
    assert!(matches!(result, Err(AnimationError::DeviceFailure(_))));
    assert_eq!(strip.brightness_level(), 0);
    assert!(!engine.is_running());

    // The failed run leaves the engine usable
    assert!(engine.trigger(AnimationRequest::Clear).is_accepted());
}

#[tokio::test(start_paused = true)]
async fn diagnostic_suite_runs_fill_scan_clear() {
    let (engine, strip) = engine_with(fast_config(4), Arc::new(NoRain));
    let outcome = engine.trigger_test().into_handle().unwrap().await.unwrap();
    assert_eq!(outcome, Ok(RunOutcome::Completed));

    let frames = strip.frames();
    assert!(frames[0].pixels.iter().all(|p| *p == RED));
    assert!(frames.last().unwrap().pixels.iter().all(|p| *p == BLACK));
    // Fill, two renders per scanned pixel, clear
    assert_eq!(frames.len(), 1 + 2 * 4 + 1);
}

#[tokio::test(start_paused = true)]
async fn diagnostic_suite_stops_between_steps() {
    let (engine, strip) = engine_with(fast_config(4), Arc::new(NoRain));
    let handle = engine.trigger_test().into_handle().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.cancel_running();
    assert_eq!(handle.await.unwrap(), Ok(RunOutcome::Cancelled));

    // Only the red fill made it out
    assert_eq!(strip.render_count(), 1);
    assert!(strip.pixels().iter().all(|p| *p == RED));
}

#[tokio::test(start_paused = true)]
async fn is_running_brackets_the_run() {
    let (engine, _strip) = engine_with(fast_config(4), Arc::new(NoRain));
    assert!(!engine.is_running());

    let probe = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut samples = Vec::new();
            for _ in 0..4 {
                samples.push(engine.is_running());
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            samples
        })
    };

    let handle = engine
        .trigger(AnimationRequest::ColorFill(WHITE))
        .into_handle()
        .unwrap();
    // Fill holds for 500 ms; the probe samples at 0, 100, 200, 300 ms
    assert_eq!(probe.await.unwrap(), vec![true; 4]);
    handle.await.unwrap().unwrap();

    let after = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.is_running() })
    };
    assert!(!after.await.unwrap());
}
