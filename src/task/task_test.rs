use std::time::{Duration, SystemTime};

use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

use super::*;
use crate::mock::mock_time::MockTime;
use crate::mock::mock_transport::{MockRtcpSession, MockRtpSource};

#[test]
fn test_timer_fire_disarms() {
    let t0 = SystemTime::UNIX_EPOCH;
    let mut timer = Timer::new(Duration::from_millis(20));
    assert!(!timer.is_active());
    assert!(!timer.fire(t0));

    timer.restart(t0);
    assert_eq!(timer.deadline(), Some(t0 + Duration::from_millis(20)));
    assert!(!timer.fire(t0 + Duration::from_millis(19)));
    assert!(timer.fire(t0 + Duration::from_millis(20)));
    assert!(!timer.is_active());

    timer.set_timeout(Duration::from_secs(1));
    timer.restart(t0);
    timer.stop();
    assert!(!timer.fire(t0 + Duration::from_secs(2)));
}

#[test]
fn test_earliest() {
    let t0 = SystemTime::UNIX_EPOCH;
    let t1 = t0 + Duration::from_millis(5);
    assert_eq!(earliest([None, None]), None);
    assert_eq!(earliest([Some(t1), None, Some(t0)]), Some(t0));
}

#[test]
fn test_outbox_take() {
    let mut outbox = Outbox::default();
    assert!(outbox.is_empty());
    outbox.push_feedback(PictureLossIndication {
        sender_ssrc: 1,
        media_ssrc: 2,
    });
    outbox.keepalives.push(63);

    let taken = outbox.take();
    assert!(outbox.is_empty());
    assert_eq!(taken.feedback.len(), 1);
    assert_eq!(taken.keepalives, vec![63]);
}

#[derive(Debug)]
enum TestEvent {
    Add(u32),
    Echo(u32),
}

/// Sums posted values, asks for a PLI every `period` and echoes through the sender.
struct TestHandler {
    sum: u32,
    echoes: u32,
    timer: Timer,
    outbox: Outbox,
}

impl TestHandler {
    fn new(period: Duration, now: SystemTime) -> Self {
        let mut timer = Timer::new(period);
        timer.restart(now);
        TestHandler {
            sum: 0,
            echoes: 0,
            timer,
            outbox: Outbox::default(),
        }
    }
}

impl TaskHandler for TestHandler {
    type Event = TestEvent;

    fn handle_event(&mut self, event: TestEvent, _now: SystemTime, tx: &EventSender<TestEvent>) {
        match event {
            TestEvent::Add(n) => {
                self.sum += n;
                tx.post(TestEvent::Echo(n));
            }
            TestEvent::Echo(_) => self.echoes += 1,
        }
    }

    fn handle_timers(&mut self, now: SystemTime) {
        if self.timer.fire(now) {
            self.outbox.push_feedback(PictureLossIndication {
                sender_ssrc: 1,
                media_ssrc: 2,
            });
            self.outbox.keepalives.push(63);
            self.timer.restart(now);
        }
    }

    fn next_deadline(&self) -> Option<SystemTime> {
        self.timer.deadline()
    }

    fn take_outbox(&mut self) -> Outbox {
        self.outbox.take()
    }
}

#[tokio::test]
async fn test_playback_task_events_and_close() -> Result<()> {
    let handler = TestHandler::new(Duration::from_secs(3600), SystemTime::now());
    let task = PlaybackTask::spawn(handler, TaskIo::default(), system_time());

    assert!(task.post(TestEvent::Add(2)));
    assert!(task.sender().post(TestEvent::Add(5)));

    let mut tries = 0;
    while task.with_handler(|h| h.echoes) < 2 && tries < 100 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        tries += 1;
    }
    assert_eq!(task.with_handler(|h| (h.sum, h.echoes)), (7, 2));

    task.close().await?;
    assert_eq!(task.close().await, Err(Error::ErrTaskClosed));
    assert!(!task.post(TestEvent::Add(1)));

    Ok(())
}

#[tokio::test]
async fn test_playback_task_flushes_timer_output() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let mock_time = Arc::new(MockTime::default());
    let rtcp = Arc::new(MockRtcpSession::default());
    let rtp = Arc::new(MockRtpSource::new());
    let io = TaskIo {
        rtp: Some(rtp.clone() as Arc<dyn RtpSource + Send + Sync>),
        rtcp: Some(rtcp.clone() as Arc<dyn RtcpSession + Send + Sync>),
    };

    let handler = TestHandler::new(Duration::from_millis(20), mock_time.now());
    let task = PlaybackTask::spawn(handler, io, mock_time.time_gen());

    // the mock clock has not moved, so nothing is due yet
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(rtcp.feedback().is_empty());

    mock_time.advance(Duration::from_millis(20));
    task.sender().wake();
    rtcp.wait_feedback(1).await;

    let feedback = rtcp.feedback();
    assert_eq!(feedback.len(), 1);
    let pli = feedback[0]
        .as_any()
        .downcast_ref::<PictureLossIndication>()
        .expect("pli");
    assert_eq!(pli.media_ssrc, 2);

    let mut tries = 0;
    while rtp.keepalives().is_empty() && tries < 100 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        tries += 1;
    }
    assert_eq!(rtp.keepalives(), vec![63]);

    task.close().await?;
    Ok(())
}
