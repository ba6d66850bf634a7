use crossbeam_channel::Receiver;
use myy_playback::core::{
    FrameDrop, MediaType, PixelFormat, PlaybackState, PlayerConfig, PlayerEvent, Result, SeekTarget, StreamInfo,
};
use myy_playback::player::demuxer_source::ReadOutcome;
use myy_playback::player::{
    DefaultSourceFactory, InterruptFlag, MediaSource, NullAudioDevice, PlaybackController, SourceFactory,
    StreamDecoder, SyntheticSource,
};
use myy_playback::renderer::{DisplayCapabilities, NullRenderer, RenderLog};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn controller(config: PlayerConfig) -> PlaybackController {
    PlaybackController::new(config, Arc::new(DefaultSourceFactory), Arc::new(NullAudioDevice))
}

fn start(player: &mut PlaybackController, url: &str) -> Arc<Mutex<RenderLog>> {
    start_with(player, url, NullRenderer::new(640, 480))
}

fn start_with(player: &mut PlaybackController, url: &str, renderer: NullRenderer) -> Arc<Mutex<RenderLog>> {
    let log = renderer.log();
    player.play(url, Box::new(renderer)).unwrap();
    log
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn wait_for_event(events: &Receiver<PlayerEvent>, timeout: Duration, mut pred: impl FnMut(&PlayerEvent) -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) if pred(&event) => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}

fn upload_count(log: &Arc<Mutex<RenderLog>>) -> usize {
    log.lock().uploads.len()
}

/// 第一帧与 `serial` 不同代次的画面时间戳
fn first_pts_after(log: &Arc<Mutex<RenderLog>>, serial: u64) -> Option<f64> {
    log.lock()
        .uploads
        .iter()
        .find(|(_, s)| *s != serial)
        .and_then(|(pts, _)| *pts)
}

fn pause_and_settle(player: &mut PlaybackController, events: &Receiver<PlayerEvent>) {
    player.pause();
    assert!(wait_for_event(events, Duration::from_secs(2), |e| *e == PlayerEvent::PauseState(true)));
    thread::sleep(Duration::from_millis(100));
}

/// 流编号前面留出两个不可播放的数据流（编号与 `streams()` 中的位置不同）
const DATA_STREAMS: usize = 2;

struct OffsetSource {
    inner: SyntheticSource,
    streams: Vec<StreamInfo>,
}

impl MediaSource for OffsetSource {
    fn description(&self) -> String {
        self.inner.description()
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<ReadOutcome> {
        Ok(match self.inner.read_packet()? {
            ReadOutcome::Packet(mut packet) => {
                packet.stream_index += DATA_STREAMS;
                ReadOutcome::Packet(packet)
            }
            ReadOutcome::Eof => ReadOutcome::Eof,
        })
    }

    fn seek(&mut self, target: SeekTarget) -> Result<()> {
        self.inner.seek(target)
    }

    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn StreamDecoder>> {
        self.inner.open_decoder(stream_index - DATA_STREAMS)
    }

    fn duration(&self) -> Option<f64> {
        self.inner.duration()
    }
}

struct OffsetFactory;

impl SourceFactory for OffsetFactory {
    fn open(&self, url: &str, interrupt: InterruptFlag) -> Result<Box<dyn MediaSource>> {
        let inner = SyntheticSource::open(url, interrupt)?;
        let streams = inner
            .streams()
            .iter()
            .cloned()
            .map(|mut s| {
                s.index += DATA_STREAMS;
                s
            })
            .collect();
        Ok(Box::new(OffsetSource { inner, streams }))
    }
}

#[test]
fn stop_joins_threads_and_aborts_queues() {
    let mut player = controller(PlayerConfig::default());
    let log = start(&mut player, "synthetic://stop?duration=30&subtitles=1");
    assert!(wait_until(Duration::from_secs(3), || upload_count(&log) > 0));
    let (videoq, audioq, subtitleq) = player.packet_queues().unwrap();
    assert!(player.is_running());

    player.stop();
    assert_eq!(player.state(), PlaybackState::Stopped);
    assert!(!player.is_running());
    assert!(videoq.is_aborted() && audioq.is_aborted() && subtitleq.is_aborted());
    assert_eq!(videoq.nb_packets(), 0);

    // 停止后不再有新画面
    let uploads = upload_count(&log);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(upload_count(&log), uploads);
}

#[test]
fn seek_shows_frame_at_target() {
    let config = PlayerConfig {
        frame_drop: FrameDrop::Never,
        ..PlayerConfig::default()
    };
    let mut player = controller(config);
    let log = start(&mut player, "synthetic://seek?duration=60&fps=25");
    assert!(wait_until(Duration::from_secs(3), || upload_count(&log) > 2));
    let first_serial = log.lock().uploads[0].1;

    player.seek(30.0, false).unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        log.lock().uploads.iter().any(|(_, serial)| *serial != first_serial)
    }));
    let after = log
        .lock()
        .uploads
        .iter()
        .find(|(_, serial)| *serial != first_serial)
        .and_then(|(pts, _)| *pts)
        .unwrap();
    assert!((after - 30.0).abs() <= 0.04 + 1e-6, "first frame after seek at {}", after);
    player.stop();
}

#[test]
fn paused_steps_advance_one_frame_each() {
    let mut player = controller(PlayerConfig::default());
    let events = player.events();
    let log = start(&mut player, "synthetic://step?duration=60");
    assert!(wait_until(Duration::from_secs(3), || upload_count(&log) > 2));

    player.pause();
    assert!(wait_for_event(&events, Duration::from_secs(2), |e| *e == PlayerEvent::PauseState(true)));
    thread::sleep(Duration::from_millis(100));
    let before = upload_count(&log);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(upload_count(&log), before, "paused playback must not show new frames");

    for _ in 0..5 {
        player.step();
        assert!(wait_for_event(&events, Duration::from_secs(2), |e| *e == PlayerEvent::PauseState(true)));
    }
    thread::sleep(Duration::from_millis(100));

    let log = log.lock();
    assert_eq!(log.uploads.len(), before + 5);
    let stepped: Vec<f64> = log.uploads[before - 1..].iter().filter_map(|(pts, _)| *pts).collect();
    assert!(stepped.windows(2).all(|w| w[1] > w[0]), "pts not increasing: {:?}", stepped);
    drop(log);
    assert_eq!(player.state(), PlaybackState::Paused);
    player.stop();
}

#[test]
fn open_failure_is_fatal_and_starts_nothing() {
    let mut player = controller(PlayerConfig::default());
    let events = player.events();
    let err = player
        .play("synthetic://bad?bogus=1", Box::new(NullRenderer::default()))
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(!player.is_running());
    assert!(player.packet_queues().is_none());
    assert!(wait_for_event(&events, Duration::from_millis(200), |e| matches!(e, PlayerEvent::Error(_))));
}

#[test]
fn reader_stops_when_queues_have_enough() {
    let mut player = controller(PlayerConfig::default());
    let log = start(&mut player, "synthetic://pressure?duration=600");
    assert!(wait_until(Duration::from_secs(3), || upload_count(&log) > 0));
    thread::sleep(Duration::from_millis(300));

    let (videoq, audioq, _) = player.packet_queues().unwrap();
    // 600 秒的源立刻可读完，背压生效时每个队列只缓存约一秒多
    assert!(videoq.nb_packets() < 100, "video packets = {}", videoq.nb_packets());
    assert!(audioq.nb_packets() < 200, "audio packets = {}", audioq.nb_packets());
    assert!(videoq.size_bytes() + audioq.size_bytes() <= player.config().queues.max_queue_bytes);
    player.stop();
}

#[test]
fn end_of_media_reported() {
    let config = PlayerConfig {
        auto_exit: true,
        ..PlayerConfig::default()
    };
    let mut player = controller(config);
    let events = player.events();
    let started = Instant::now();
    start(&mut player, "synthetic://eof?duration=1");
    assert!(wait_for_event(&events, Duration::from_secs(5), |e| *e == PlayerEvent::EndOfMedia));
    assert!(started.elapsed() >= Duration::from_millis(800));
    player.stop();
}

#[test]
fn loop_count_replays_before_end() {
    let config = PlayerConfig {
        loop_count: 2,
        ..PlayerConfig::default()
    };
    let mut player = controller(config);
    let events = player.events();
    let started = Instant::now();
    start(&mut player, "synthetic://loop?duration=0.6");
    assert!(wait_for_event(&events, Duration::from_secs(6), |e| *e == PlayerEvent::EndOfMedia));
    assert!(started.elapsed() >= Duration::from_millis(1100), "ended after {:?}", started.elapsed());
    player.stop();
}

#[test]
fn audio_only_source_reports_position() {
    let mut player = controller(PlayerConfig::default());
    let events = player.events();
    let log = start(&mut player, "synthetic://radio?duration=10&video=0");
    assert!(wait_for_event(&events, Duration::from_secs(3), |e| {
        matches!(e, PlayerEvent::Position(p) if *p >= 1.0)
    }));
    assert_eq!(upload_count(&log), 0);
    player.stop();
}

#[test]
fn subtitle_stream_can_be_cycled_off_and_on() {
    let mut player = controller(PlayerConfig::default());
    let log = start(&mut player, "synthetic://subs?duration=20&subtitles=1");
    assert!(wait_until(Duration::from_secs(3), || upload_count(&log) > 0));

    player.cycle_stream(MediaType::Subtitle).unwrap();
    thread::sleep(Duration::from_millis(100));
    player.cycle_stream(MediaType::Subtitle).unwrap();
    let uploads = upload_count(&log);
    assert!(wait_until(Duration::from_secs(2), || upload_count(&log) > uploads + 5));
    assert!(player.is_running());
    player.stop();
}

#[test]
fn rapid_steps_each_show_a_frame() {
    let mut player = controller(PlayerConfig::default());
    let events = player.events();
    let log = start(&mut player, "synthetic://rapid?duration=60");
    assert!(wait_until(Duration::from_secs(3), || upload_count(&log) > 2));
    pause_and_settle(&mut player, &events);
    let before = upload_count(&log);

    for _ in 0..5 {
        player.step();
    }
    assert!(wait_until(Duration::from_secs(3), || upload_count(&log) >= before + 5));
    assert!(wait_until(Duration::from_secs(1), || player.state() == PlaybackState::Paused));
    thread::sleep(Duration::from_millis(200));

    let log = log.lock();
    assert_eq!(log.uploads.len(), before + 5);
    let stepped: Vec<f64> = log.uploads[before - 1..].iter().filter_map(|(pts, _)| *pts).collect();
    assert!(stepped.windows(2).all(|w| w[1] > w[0]), "pts not increasing: {:?}", stepped);
    drop(log);
    assert_eq!(player.state(), PlaybackState::Paused);
    player.stop();
}

#[test]
fn step_back_shows_an_earlier_frame() {
    let config = PlayerConfig {
        frame_drop: FrameDrop::Never,
        ..PlayerConfig::default()
    };
    let mut player = controller(config);
    let events = player.events();
    let log = start(&mut player, "synthetic://back?duration=60&audio=0");
    assert!(wait_until(Duration::from_secs(3), || upload_count(&log) > 10));
    pause_and_settle(&mut player, &events);
    let before = upload_count(&log);
    let (last_pts, serial) = log.lock().uploads[before - 1];
    let last_pts = last_pts.unwrap();

    player.step_back().unwrap();
    assert!(wait_until(Duration::from_secs(3), || first_pts_after(&log, serial).is_some()));
    thread::sleep(Duration::from_millis(200));

    assert_eq!(upload_count(&log), before + 1);
    let shown = first_pts_after(&log, serial).unwrap();
    assert!(shown < last_pts, "step back showed {} after {}", shown, last_pts);
    assert!(shown >= last_pts - 0.08 - 1e-6, "step back went to {} from {}", shown, last_pts);
    assert_eq!(player.state(), PlaybackState::Paused);
    player.stop();
}

#[test]
fn seek_chapter_lands_on_next_chapter() {
    let config = PlayerConfig {
        frame_drop: FrameDrop::Never,
        ..PlayerConfig::default()
    };
    let mut player = controller(config);
    let log = start(&mut player, "synthetic://chapters?duration=30&chapters=3");
    assert!(wait_until(Duration::from_secs(3), || upload_count(&log) > 2));
    assert_eq!(player.chapters().len(), 3);
    let serial = log.lock().uploads[0].1;

    player.seek_chapter(1).unwrap();
    assert!(wait_until(Duration::from_secs(3), || first_pts_after(&log, serial).is_some()));
    let shown = first_pts_after(&log, serial).unwrap();
    assert!((shown - 10.0).abs() <= 0.04 + 1e-6, "chapter seek showed {}", shown);
    player.stop();
}

#[test]
fn realtime_source_may_exceed_queue_thresholds() {
    let config = PlayerConfig::default();
    let min_frames = config.queues.min_frames;
    let cap = (min_frames as f64 * config.queues.realtime_headroom) as usize;
    let mut player = controller(config);
    let events = player.events();
    let log = start(&mut player, "synthetic://live?duration=600&realtime=1");
    assert!(wait_until(Duration::from_secs(3), || upload_count(&log) > 0));
    // 暂停后消费停止，读线程只受背压限制
    pause_and_settle(&mut player, &events);

    let (videoq, _, _) = player.packet_queues().unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || videoq.nb_packets() > min_frames + 1),
        "video packets = {}",
        videoq.nb_packets()
    );
    thread::sleep(Duration::from_millis(1000));
    let level = videoq.nb_packets();
    assert!(level > min_frames + 1 && level <= cap + 8, "video packets = {} (cap {})", level, cap);
    player.stop();
}

#[test]
fn infinite_buffer_disables_backpressure() {
    let config = PlayerConfig {
        infinite_buffer: Some(true),
        ..PlayerConfig::default()
    };
    let cap = (config.queues.min_frames as f64 * config.queues.realtime_headroom) as usize;
    let mut player = controller(config);
    let events = player.events();
    let log = start(&mut player, "synthetic://unbounded?duration=600&realtime=1");
    assert!(wait_until(Duration::from_secs(3), || upload_count(&log) > 0));
    pause_and_settle(&mut player, &events);

    let (videoq, _, _) = player.packet_queues().unwrap();
    assert!(
        wait_until(Duration::from_secs(6), || videoq.nb_packets() > cap + 20),
        "video packets = {}",
        videoq.nb_packets()
    );
    player.stop();
}

#[test]
fn streams_are_looked_up_by_stream_number() {
    let mut player = PlaybackController::new(PlayerConfig::default(), Arc::new(OffsetFactory), Arc::new(NullAudioDevice));
    let events = player.events();
    let renderer = NullRenderer::new(640, 480);
    let log = renderer.log();
    let info = player
        .play("synthetic://offset?duration=10&subtitles=1", Box::new(renderer))
        .unwrap();
    assert_eq!((info.width, info.height), (320, 240));
    assert_eq!(info.sample_rate, 48_000);

    assert!(wait_until(Duration::from_secs(3), || upload_count(&log) > 5));
    assert!(wait_for_event(&events, Duration::from_secs(3), |e| {
        matches!(e, PlayerEvent::Position(p) if *p >= 1.0)
    }));
    assert!(player.is_running());
    player.stop();
}

#[test]
fn pictures_beyond_renderer_capabilities_are_not_uploaded() {
    let mut player = controller(PlayerConfig::default());
    let events = player.events();
    let renderer = NullRenderer::new(640, 480).with_capabilities(DisplayCapabilities {
        max_width: 160,
        max_height: 120,
        formats: vec![PixelFormat::RGBA],
    });
    let log = start_with(&mut player, "synthetic://huge?duration=10", renderer);

    assert!(wait_for_event(&events, Duration::from_secs(3), |e| matches!(e, PlayerEvent::Error(_))));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(upload_count(&log), 0);
    assert!(log.lock().surface.is_none());
    assert!(player.is_running());
    player.stop();
}
