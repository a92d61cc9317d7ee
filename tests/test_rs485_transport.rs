mod common;
use common::*;

use lux_dongle_bridge::rs485::{State, PROBE_REGISTER};
use std::time::Duration;
use tokio::time::advance;

fn transport(line: MockLine) -> (Transport<MockLine>, std::sync::Arc<GuardArbiter>) {
    let arbiter = GuardArbiter::new();
    (
        Transport::new(line, TransportSettings::default(), arbiter.clone()),
        arbiter,
    )
}

async fn settle(t: &mut Transport<MockLine>) {
    t.poll().await.unwrap();
    advance(SETTLE).await;
    t.poll().await.unwrap();
}

async fn linked() -> Transport<MockLine> {
    let (mut t, _) = transport(MockLine::answering_probes(Factory::inverter_serial()));
    t.begin();
    t.poll().await.unwrap();
    settle(&mut t).await;
    assert!(t.is_link_up());
    t
}

#[tokio::test(start_paused = true)]
async fn refuses_before_begin() {
    common_setup();

    let (mut t, _) = transport(MockLine::default());
    assert_eq!(t.state(), State::Uninitialized);
    assert!(t.send_read(DeviceFunction::ReadHold, 0, 1).await.is_err());
    t.poll().await.unwrap();
    assert!(t.line().sent.is_empty());
}

#[tokio::test(start_paused = true)]
async fn probe_brings_link_up() {
    common_setup();

    let (mut t, arbiter) = transport(MockLine::answering_probes(Factory::inverter_serial()));
    t.begin();
    t.poll().await.unwrap();

    assert_eq!(t.state(), State::ProbePending);
    let probe = t.line().last_sent().unwrap().clone();
    assert_eq!(probe[1], 0x04);
    assert_eq!(Utils::u16ify(&probe, 12), PROBE_REGISTER);
    assert_eq!(Utils::u16ify(&probe, 14), 5);
    assert!(arbiter.is_held(), "probe holds the bus guard");

    settle(&mut t).await;

    assert!(t.is_link_up());
    assert_eq!(t.state(), State::Idle);
    assert_eq!(t.inverter_serial(), Factory::inverter_serial());
    assert_eq!(t.next_probe(), None);
    assert!(!arbiter.is_held());
    // the probe is internal; nothing for a client
    assert!(t.take_result().is_none());
    // driver asserted then released around the write
    assert_eq!(t.line().driver, vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn probe_backoff_doubles_and_caps() {
    common_setup();

    let settings = TransportSettings {
        probe_backoff_base: Duration::from_millis(5000),
        probe_backoff_max: Duration::from_millis(12_000),
        ..Default::default()
    };
    let mut t = Transport::new(MockLine::default(), settings, GuardArbiter::new());
    t.begin();

    t.poll().await.unwrap();
    assert_eq!(t.line().sent.len(), 1);

    // probe times out
    advance(Duration::from_millis(1001)).await;
    t.poll().await.unwrap();
    assert!(!t.is_link_up());
    assert_eq!(t.stats().probe_failures, 1);
    assert_eq!(t.backoff(), Duration::from_millis(10_000));

    // nothing until the backoff elapses
    advance(Duration::from_millis(4000)).await;
    t.poll().await.unwrap();
    assert_eq!(t.line().sent.len(), 1);

    advance(Duration::from_millis(1000)).await;
    t.poll().await.unwrap();
    assert_eq!(t.line().sent.len(), 2);

    advance(Duration::from_millis(1001)).await;
    t.poll().await.unwrap();
    assert_eq!(t.backoff(), Duration::from_millis(12_000));
    assert_eq!(t.stats().probe_failures, 2);
}

#[tokio::test(start_paused = true)]
async fn implausible_serial_fails_probe() {
    common_setup();

    let (mut t, _) = transport(MockLine::default());
    t.begin();
    t.poll().await.unwrap();

    let blank = Factory::read_response(0x04, 115, &[0; 5], Factory::inverter_serial());
    t.line_mut().feed(&blank);
    settle(&mut t).await;

    assert!(!t.is_link_up());
    assert_eq!(t.stats().probe_failures, 1);
    assert!(t.next_probe().is_some());
}

#[tokio::test(start_paused = true)]
async fn probe_deferred_while_guard_held() {
    common_setup();

    let (mut t, arbiter) = transport(MockLine::default());
    let scan = arbiter.try_acquire(GuardKind::WifiScan, "scan").unwrap();
    t.begin();
    t.poll().await.unwrap();
    assert!(t.line().sent.is_empty());

    drop(scan);
    t.poll().await.unwrap();
    assert_eq!(t.line().sent.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn send_read_while_link_down_schedules_probe() {
    common_setup();

    let (mut t, arbiter) = transport(MockLine::default());
    t.begin();
    let guard = arbiter.try_acquire(GuardKind::FirmwareUpdate, "ota").unwrap();
    t.poll().await.unwrap();
    drop(guard);

    let err = t.send_read(DeviceFunction::ReadHold, 0, 1).await.unwrap_err();
    assert!(err.to_string().contains("link down"));
    assert!(t.next_probe().is_some());
    assert!(t.line().sent.is_empty());
}

#[tokio::test(start_paused = true)]
async fn read_exchange() {
    common_setup();

    let mut t = linked().await;
    t.send_read(DeviceFunction::ReadHold, 0, 3).await.unwrap();
    assert_eq!(t.state(), State::AwaitingResponse);
    assert!(t.is_waiting());

    let sent = t.line().last_sent().unwrap().clone();
    assert_eq!(&sent[2..12], b"AB12345678");

    // busy while outstanding
    assert!(t.send_read(DeviceFunction::ReadHold, 0, 3).await.is_err());

    let reply = Factory::read_response(0x03, 0, &[1, 2, 3], Factory::inverter_serial());
    t.line_mut().feed(&reply);

    // not processed until the line has been quiet
    t.poll().await.unwrap();
    assert!(t.take_result().is_none());
    advance(SETTLE).await;
    t.poll().await.unwrap();

    let exchange = t.take_result().unwrap();
    assert!(exchange.result.success);
    assert_eq!(exchange.result.values, vec![1, 2, 3]);
    assert_eq!(exchange.raw.unwrap(), reply);
    assert_eq!(t.state(), State::Idle);
    assert_eq!(t.stats().successful, 1);
    assert!(t.take_result().is_none());
}

#[tokio::test(start_paused = true)]
async fn write_single_requires_one_value() {
    let mut t = linked().await;
    assert!(t
        .send_write(DeviceFunction::WriteSingle, 20, &[1, 2])
        .await
        .is_err());
    assert!(t.send_write(DeviceFunction::ReadHold, 20, &[1]).await.is_err());
    t.send_write(DeviceFunction::WriteMulti, 20, &[1])
        .await
        .unwrap();
    assert_eq!(t.line().last_sent().unwrap()[1], 0x10);
}

#[tokio::test(start_paused = true)]
async fn timeout_releases_waiting_state() {
    common_setup();

    let mut t = linked().await;
    t.send_read(DeviceFunction::ReadInput, 0, 40).await.unwrap();

    advance(Duration::from_millis(1000)).await;
    t.poll().await.unwrap();
    assert!(t.is_waiting(), "window is inclusive");

    advance(Duration::from_millis(1)).await;
    t.poll().await.unwrap();
    assert!(!t.is_waiting());

    let exchange = t.take_result().unwrap();
    assert!(!exchange.result.success);
    assert_eq!(exchange.result.error.as_deref(), Some("Timeout"));
    assert!(exchange.raw.is_none());
    assert_eq!(t.stats().timeouts, 1);
    assert_eq!(t.stats().failed, 1);
    // a request timeout does not drop the link
    assert!(t.is_link_up());
}

#[tokio::test(start_paused = true)]
async fn picks_our_response_after_foreign_exchange() {
    common_setup();

    let serial = Factory::inverter_serial();
    let mut t = linked().await;
    t.send_read(DeviceFunction::ReadHold, 21, 1).await.unwrap();

    let mut burst = bus::encode_read(DeviceFunction::ReadInput, 0, 40, serial).unwrap();
    burst.extend(Factory::read_response(0x04, 0, &Factory::input_values(40), serial));
    burst.extend(Factory::read_response(0x03, 21, &[0xabcd], serial));
    t.line_mut().feed(&burst);
    settle(&mut t).await;

    let exchange = t.take_result().unwrap();
    assert!(exchange.result.success);
    assert_eq!(exchange.result.values, vec![0xabcd]);
    assert_eq!(t.stats().foreign_frames, 1);
}

#[tokio::test(start_paused = true)]
async fn keeps_waiting_through_foreign_traffic() {
    common_setup();

    let serial = Factory::inverter_serial();
    let mut t = linked().await;
    t.send_read(DeviceFunction::ReadHold, 21, 1).await.unwrap();

    let mut foreign = bus::encode_read(DeviceFunction::ReadInput, 0, 40, serial).unwrap();
    foreign.extend(Factory::read_response(0x04, 0, &Factory::input_values(40), serial));
    t.line_mut().feed(&foreign);
    settle(&mut t).await;

    assert!(t.is_waiting());
    assert!(t.take_result().is_none());

    t.line_mut()
        .feed(&Factory::read_response(0x03, 21, &[7], serial));
    settle(&mut t).await;
    assert_eq!(t.take_result().unwrap().result.values, vec![7]);
}

#[tokio::test(start_paused = true)]
async fn mismatched_response_fails_exchange() {
    common_setup();

    let mut t = linked().await;
    t.send_read(DeviceFunction::ReadHold, 0, 1).await.unwrap();

    let other = Factory::read_response(0x03, 40, &[1], Factory::inverter_serial());
    t.line_mut().feed(&other);
    settle(&mut t).await;

    let exchange = t.take_result().unwrap();
    assert!(!exchange.result.success);
    assert!(exchange
        .result
        .error
        .unwrap()
        .starts_with("Response mismatch"));
}

#[tokio::test(start_paused = true)]
async fn exception_response_completes_exchange() {
    common_setup();

    let mut t = linked().await;
    t.send_read(DeviceFunction::ReadHold, 500, 1).await.unwrap();

    let exception = Factory::exception_response(0x03, 500, 0x02, Factory::inverter_serial());
    t.line_mut().feed(&exception);
    settle(&mut t).await;

    let exchange = t.take_result().unwrap();
    assert!(exchange.result.is_exception());
    assert_eq!(exchange.raw.unwrap(), exception);
}

#[tokio::test(start_paused = true)]
async fn resyncs_on_garbage() {
    common_setup();

    let mut t = linked().await;
    t.send_read(DeviceFunction::ReadHold, 0, 1).await.unwrap();

    // no complete frame, but a response marker after some noise
    t.line_mut().feed(&[0x77, 0x88, 0x01, 0x03, 0x41]);
    settle(&mut t).await;
    t.poll().await.unwrap();

    assert_eq!(t.stats().resyncs, 1);
    assert!(t.stats().discarded_bytes >= 2);
    assert!(t.is_waiting());
}

#[tokio::test(start_paused = true)]
async fn unsolicited_bytes_are_ignored() {
    common_setup();

    let mut t = linked().await;
    t.line_mut()
        .feed(&Factory::read_response(0x03, 0, &[1], Factory::inverter_serial()));
    settle(&mut t).await;

    assert_eq!(t.stats().ignored_packets, 1);
    assert!(t.take_result().is_none());
}

#[tokio::test(start_paused = true)]
async fn oversized_buffer_is_discarded() {
    common_setup();

    let mut t = linked().await;
    t.send_read(DeviceFunction::ReadHold, 0, 1).await.unwrap();
    t.line_mut().feed(&[0x55; 2000]);
    t.poll().await.unwrap();

    assert_eq!(t.stats().discarded_bytes, 2000);
    assert!(t.is_waiting());
}

#[tokio::test(start_paused = true)]
async fn crc_errors_are_counted() {
    common_setup();

    let mut t = linked().await;
    t.send_read(DeviceFunction::ReadHold, 0, 1).await.unwrap();

    let mut reply = Factory::read_response(0x03, 0, &[9], Factory::inverter_serial());
    let last = reply.len() - 1;
    reply[last] ^= 0x01;
    t.line_mut().feed(&reply);
    settle(&mut t).await;

    let exchange = t.take_result().unwrap();
    assert!(exchange.result.success);
    assert!(exchange.result.crc_mismatch());
    assert_eq!(t.stats().crc_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn noise_with_exception_bit_does_not_hide_response() {
    common_setup();

    let mut t = linked().await;
    t.send_read(DeviceFunction::ReadInput, 0, 5).await.unwrap();

    // 0x01 0xFF looks like an exception header but names no known function
    let reply = Factory::read_response(0x04, 0, &Factory::input_values(5), Factory::inverter_serial());
    let mut noisy = vec![0x01, 0xff];
    noisy.extend_from_slice(&reply);
    t.line_mut().feed(&noisy);
    settle(&mut t).await;

    let exchange = t.take_result().unwrap();
    assert!(exchange.result.success);
    assert_eq!(exchange.result.values, Factory::input_values(5));
    assert_eq!(exchange.raw.unwrap(), reply);
    assert_eq!(t.stats().failed, 0);
}

#[tokio::test(start_paused = true)]
async fn undecodable_noise_is_not_a_failed_exchange() {
    common_setup();

    let mut t = linked().await;
    t.send_read(DeviceFunction::ReadInput, 0, 5).await.unwrap();

    t.line_mut().feed(&[0x01, 0xff, 0x13, 0x01, 0x85, 0x00, 0x00]);
    settle(&mut t).await;
    t.poll().await.unwrap();

    assert!(t.is_waiting());
    assert!(t.take_result().is_none());
    assert_eq!(t.stats().failed, 0);

    // the answer still gets through inside the window
    t.line_mut().feed(&Factory::read_response(
        0x04,
        0,
        &Factory::input_values(5),
        Factory::inverter_serial(),
    ));
    settle(&mut t).await;
    assert!(t.take_result().unwrap().result.success);
}
