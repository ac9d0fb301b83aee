// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::vec::Vec;

use super::*;
use crate::client::{
    DeviceFrame, DeviceFrameDecoder, MAX_COMMAND_FRAME_LEN, RawFrame, ValueTable, encode_command,
};
use crate::frame::INBOUND_MAGIC;
use crate::personality::{ADC_MCA_TIMED, GEIGER_TIME_SERIES};
use crate::store::{RamFlash, StoreLayout};
use crate::table::TableKind;
use crate::testutil::{MockReset, MockSource, MockTransport};

/// Four 3-byte histogram bins
const TABLE: usize = 12;

type Flash = RamFlash<256>;
type TestFirmware<'a, const N: usize> =
    Firmware<'a, MockTransport, Flash, MockSource, MockReset, N, 4>;

fn layout() -> StoreLayout {
    StoreLayout {
        section1: 0..128,
        section2: 128..256,
    }
}

fn blank_flash() -> Flash {
    RamFlash::new(0, 64)
}

fn flash_with_params(params: &[u8]) -> Flash {
    let mut store: EepFlash<Flash, 4> = EepFlash::init(blank_flash(), layout()).unwrap();
    store.write(PARAM_BLOCK_ID, params).unwrap();
    store.into_flash()
}

fn firmware<const N: usize>(
    ctx: &DeviceContext<N>,
    flash: Flash,
    personality: Personality,
) -> TestFirmware<'_, N> {
    let store = EepFlash::init(flash, layout()).unwrap();
    Firmware::new(
        MockTransport::new(),
        ctx,
        store,
        MockSource::default(),
        MockReset::default(),
        personality,
    )
}

/// Booted firmware with the boot output discarded.
fn booted<const N: usize>(ctx: &DeviceContext<N>, flash: Flash) -> TestFirmware<'_, N> {
    let mut fw = firmware(ctx, flash, ADC_MCA_TIMED);
    fw.boot().unwrap();
    fw.transport_mut().take_sent();
    fw
}

fn command<const N: usize>(fw: &mut TestFirmware<'_, N>, cmd: Command, params: &[u8]) {
    let mut buf = [0u8; MAX_COMMAND_FRAME_LEN];
    let len = encode_command(cmd, params, &mut buf).unwrap();
    fw.transport_mut().push_rx(&buf[..len]);
}

/// Poll until the input is consumed and nothing is pending.
fn run<const N: usize>(fw: &mut TestFirmware<'_, N>) -> Poll {
    loop {
        if fw.state() != State::Measuring && fw.transport().rx_pending() == 0 {
            return Poll::Continue;
        }
        match fw.poll().unwrap() {
            Poll::Continue => {}
            other => return other,
        }
    }
}

/// Decode everything sent since the last call.
fn sent<const N: usize>(fw: &mut TestFirmware<'_, N>) -> Vec<RawFrame<64>> {
    let bytes = fw.transport_mut().take_sent();
    let mut decoder = DeviceFrameDecoder::<64>::new();
    bytes
        .iter()
        .filter_map(|&b| decoder.push(b).unwrap())
        .collect()
}

fn state_of(frame: &RawFrame<64>) -> DeviceState {
    match frame.parse() {
        Ok(DeviceFrame::State(state)) => state,
        other => panic!("expected a state frame, got {other:?}"),
    }
}

fn text_of(frame: &RawFrame<64>) -> &str {
    match frame.parse() {
        Ok(DeviceFrame::Text(text)) => text,
        other => panic!("expected a text frame, got {other:?}"),
    }
}

fn table_of(frame: &RawFrame<64>) -> ValueTable<'_> {
    match frame.parse() {
        Ok(DeviceFrame::ValueTable(table)) => table,
        other => panic!("expected a value table, got {other:?}"),
    }
}

#[test]
fn boot_announces_and_enters_ready() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = firmware(&ctx, blank_flash(), ADC_MCA_TIMED);
    fw.boot().unwrap();

    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 3);
    assert_eq!(text_of(&frames[0]), "Booting");
    assert_eq!(text_of(&frames[1]), VERSION);
    assert_eq!(state_of(&frames[2]), DeviceState::Ready);
    assert_eq!(fw.state(), State::Ready);
    assert!(fw.params().is_empty());
}

#[test]
fn boot_loads_stored_params() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let fw = booted(&ctx, flash_with_params(&[5, 0, 1, 0]));
    assert_eq!(fw.params(), &[5, 0, 1, 0]);
}

#[test]
fn boot_reports_invalid_stored_params() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = firmware(&ctx, flash_with_params(&[5, 0]), ADC_MCA_TIMED);
    fw.boot().unwrap();
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 4);
    assert_eq!(text_of(&frames[0]), "Booting");
    assert_eq!(text_of(&frames[2]), "invalid stored data");
    assert_eq!(state_of(&frames[3]), DeviceState::Ready);
    assert_eq!(fw.state(), State::Ready);
    assert!(fw.params().is_empty());
}

#[test]
fn measure_finish_and_reset() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());

    command(&mut fw, Command::Measure, &[3, 0, 0, 0]);
    assert_eq!(run(&mut fw), Poll::Idle);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 1);
    assert_eq!(state_of(&frames[0]), DeviceState::Measuring);
    assert_eq!(
        fw.source().started,
        [MeasureConfig {
            duration: 3,
            skip_samples: 0
        }]
    );

    // Interrupt lane
    ctx.on_sample(1);
    ctx.on_sample(1);
    assert_eq!(run(&mut fw), Poll::Idle);
    for _ in 0..3 {
        ctx.on_tick();
    }

    run(&mut fw);
    assert_eq!(fw.state(), State::Done);
    assert_eq!(fw.source().stops, 1);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 2);
    let table = table_of(&frames[0]);
    assert_eq!(table.reason, Reason::Done);
    assert_eq!(table.kind, TableKind::Histogram);
    assert_eq!(table.elapsed, 3);
    assert_eq!(table.requested, 3);
    assert_eq!(table.params, &[3, 0, 0, 0]);
    assert_eq!(table.elements().collect::<Vec<_>>(), [0, 2, 0, 0]);
    assert_eq!(state_of(&frames[1]), DeviceState::Done);

    command(&mut fw, Command::Reset, &[]);
    assert_eq!(run(&mut fw), Poll::Reset);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 1);
    assert_eq!(state_of(&frames[0]), DeviceState::Reset);
    assert_eq!(fw.reset_control().resets, 1);

    // Nothing is processed once the reset was requested
    command(&mut fw, Command::State, &[]);
    assert_eq!(fw.poll(), Ok(Poll::Reset));
    assert!(sent(&mut fw).is_empty());
}

#[test]
fn reset_from_ready() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());

    command(&mut fw, Command::Reset, &[]);
    assert_eq!(run(&mut fw), Poll::Reset);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 1);
    assert_eq!(state_of(&frames[0]), DeviceState::Reset);
    assert_eq!(fw.reset_control().resets, 1);
    assert!(fw.source().started.is_empty());
}

#[test]
fn abort_then_resend() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());

    command(&mut fw, Command::Measure, &[50, 0, 0, 0]);
    run(&mut fw);
    ctx.on_sample(2);
    ctx.on_tick();
    sent(&mut fw);

    command(&mut fw, Command::Abort, &[]);
    run(&mut fw);
    assert_eq!(fw.state(), State::Done);
    assert!(!fw.source().running);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 2);
    let table = table_of(&frames[0]);
    assert_eq!(table.reason, Reason::Aborted);
    assert_eq!(table.elapsed, 1);
    assert_eq!(table.requested, 50);
    assert_eq!(table.element(2), Some(1));
    assert_eq!(state_of(&frames[1]), DeviceState::Done);

    // Late interrupts do not change the finished table
    ctx.on_sample(2);

    command(&mut fw, Command::Abort, &[]);
    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 2);
    let table = table_of(&frames[0]);
    assert_eq!(table.reason, Reason::Resend);
    assert_eq!(table.element(2), Some(1));
    assert_eq!(state_of(&frames[1]), DeviceState::Done);
}

#[test]
fn intermediate_keeps_measuring() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());

    command(&mut fw, Command::Measure, &[10, 0, 0, 0]);
    run(&mut fw);
    ctx.on_sample(0);
    sent(&mut fw);

    command(&mut fw, Command::Intermediate, &[]);
    assert_eq!(run(&mut fw), Poll::Idle);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 1);
    let table = table_of(&frames[0]);
    assert_eq!(table.reason, Reason::Intermediate);
    assert_eq!(table.element(0), Some(1));
    assert_eq!(fw.state(), State::Measuring);
    assert!(fw.source().running);
}

#[test]
fn invalid_commands_reannounce_state() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());

    command(&mut fw, Command::Abort, &[]);
    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 1);
    assert_eq!(state_of(&frames[0]), DeviceState::Ready);

    command(&mut fw, Command::Measure, &[1, 0, 0, 0]);
    command(&mut fw, Command::State, &[]);
    command(&mut fw, Command::Reset, &[]);
    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| state_of(f) == DeviceState::Measuring));
    assert_eq!(fw.reset_control().resets, 0);

    ctx.on_tick();
    run(&mut fw);
    sent(&mut fw);

    // STATE in DONE only announces, without resending the table
    command(&mut fw, Command::State, &[]);
    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 1);
    assert_eq!(state_of(&frames[0]), DeviceState::Done);
}

#[test]
fn parameterless_measure_reuses_params() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, flash_with_params(&[7, 0, 2, 0]));

    command(&mut fw, Command::Measure, &[]);
    run(&mut fw);
    assert_eq!(fw.state(), State::Measuring);
    assert_eq!(
        fw.source().started,
        [MeasureConfig {
            duration: 7,
            skip_samples: 2
        }]
    );
}

#[test]
fn measure_rejections() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());

    command(&mut fw, Command::Measure, &[]);
    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 2);
    assert_eq!(text_of(&frames[0]), "missing measurement parameters");
    assert_eq!(state_of(&frames[1]), DeviceState::Ready);

    command(&mut fw, Command::Measure, &[0, 0, 5, 0]);
    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(text_of(&frames[0]), "measurement duration 0 rejected");
    assert_eq!(state_of(&frames[1]), DeviceState::Ready);
    assert!(fw.source().started.is_empty());
    assert!(fw.params().is_empty());
}

#[test]
fn store_and_recall_params() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());

    command(&mut fw, Command::ParamsToStore, &[9, 0, 2, 0]);
    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 1);
    assert_eq!(state_of(&frames[0]), DeviceState::Ready);
    assert_eq!(fw.params(), &[9, 0, 2, 0]);

    let mut buf = [0u8; 16];
    let len = fw.store_mut().read(PARAM_BLOCK_ID, &mut buf).unwrap();
    assert_eq!(len, Some(4));
    assert_eq!(&buf[..4], &[9, 0, 2, 0]);

    command(&mut fw, Command::ParamsFromStore, &[]);
    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 2);
    assert_eq!(
        frames[0].parse(),
        Ok(DeviceFrame::StoredParams(&[9, 0, 2, 0]))
    );
    assert_eq!(state_of(&frames[1]), DeviceState::Ready);
}

#[test]
fn recall_missing_and_invalid_params() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());

    command(&mut fw, Command::ParamsFromStore, &[]);
    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(text_of(&frames[0]), "no stored parameters");
    assert_eq!(state_of(&frames[1]), DeviceState::Ready);

    fw.store_mut().write(PARAM_BLOCK_ID, &[1; 20]).unwrap();
    command(&mut fw, Command::ParamsFromStore, &[]);
    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(text_of(&frames[0]), "invalid stored data");
    assert_eq!(state_of(&frames[1]), DeviceState::Ready);
    assert!(fw.params().is_empty());
}

#[test]
fn store_failure_resets() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());
    fw.store_mut().flash_mut().fail_after_writes(0);

    command(&mut fw, Command::ParamsToStore, &[9, 0, 2, 0]);
    assert_eq!(run(&mut fw), Poll::Reset);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 2);
    assert_eq!(text_of(&frames[0]), "parameter store failed");
    assert_eq!(state_of(&frames[1]), DeviceState::Reset);
    assert_eq!(fw.reset_control().resets, 1);
}

#[test]
fn store_without_params_refused() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());

    command(&mut fw, Command::ParamsToStore, &[]);
    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(text_of(&frames[0]), "no parameters to store");
    assert_eq!(state_of(&frames[1]), DeviceState::Ready);
    assert_eq!(fw.store_mut().block_len(PARAM_BLOCK_ID), Ok(None));
}

#[test]
fn personality_info_reported() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());

    command(&mut fw, Command::PersonalityInfo, &[]);
    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 2);
    let Ok(DeviceFrame::PersonalityInfo(info)) = frames[0].parse() else {
        panic!("expected personality info");
    };
    assert_eq!(info.name, "adc-int-mca-timed");
    assert_eq!(info.table_bytes, TABLE as u32);
    assert_eq!(info.min_param_size(), 4);
    assert_eq!(info.units_per_second, 10);
    assert_eq!(state_of(&frames[1]), DeviceState::Ready);
}

#[test]
fn corrupt_frame_then_good_frame() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());

    let mut buf = [0u8; MAX_COMMAND_FRAME_LEN];
    let len = encode_command(Command::Measure, &[1, 0, 0, 0], &mut buf).unwrap();
    buf[len - 1] ^= 0xff;
    fw.transport_mut().push_rx(&buf[..len]);
    fw.transport_mut().push_rx(&INBOUND_MAGIC[..2]);
    command(&mut fw, Command::State, &[]);

    run(&mut fw);
    let frames = sent(&mut fw);
    assert_eq!(frames.len(), 1);
    assert_eq!(state_of(&frames[0]), DeviceState::Ready);
    assert_eq!(fw.rx_errors(), 1);
    assert!(fw.source().started.is_empty());
}

#[test]
fn start_switch_is_one_shot() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, flash_with_params(&[2, 0, 0, 0]));

    fw.switch_pressed().unwrap();
    assert_eq!(fw.state(), State::Measuring);
    assert_eq!(state_of(&sent(&mut fw)[0]), DeviceState::Measuring);

    ctx.on_tick();
    ctx.on_tick();
    run(&mut fw);
    assert_eq!(fw.state(), State::Done);

    // Ignored outside READY
    sent(&mut fw);
    fw.switch_pressed().unwrap();
    assert!(sent(&mut fw).is_empty());
    assert_eq!(fw.source().started.len(), 1);
}

#[test]
fn start_switch_locks_after_first_press() {
    let ctx: DeviceContext<TABLE> = DeviceContext::new(&ADC_MCA_TIMED);
    let mut fw = booted(&ctx, blank_flash());

    // No parameters yet, so the press is refused but still used up
    fw.switch_pressed().unwrap();
    assert_eq!(fw.state(), State::Ready);
    sent(&mut fw);

    command(&mut fw, Command::ParamsToStore, &[2, 0, 0, 0]);
    run(&mut fw);
    sent(&mut fw);
    fw.switch_pressed().unwrap();
    assert_eq!(fw.state(), State::Ready);
    assert!(sent(&mut fw).is_empty());
}

#[test]
fn time_series_measurement() {
    let ctx: DeviceContext<9> = DeviceContext::new(&GEIGER_TIME_SERIES);
    let mut fw = firmware(&ctx, blank_flash(), GEIGER_TIME_SERIES);
    fw.boot().unwrap();
    sent(&mut fw);

    command(&mut fw, Command::Measure, &[1, 0]);
    run(&mut fw);
    ctx.on_sample(0);
    ctx.on_sample(0);
    ctx.on_tick();
    ctx.on_sample(0);
    sent(&mut fw);

    command(&mut fw, Command::Intermediate, &[]);
    run(&mut fw);
    let frames = sent(&mut fw);
    let table = table_of(&frames[0]);
    assert_eq!(table.kind, TableKind::TimeSeries);
    assert_eq!(table.elements().collect::<Vec<_>>(), [2, 1]);
    assert_eq!(table.elapsed, 1);

    ctx.on_tick();
    ctx.on_tick();
    run(&mut fw);
    let frames = sent(&mut fw);
    let table = table_of(&frames[0]);
    assert_eq!(table.reason, Reason::Done);
    assert_eq!(table.elements().collect::<Vec<_>>(), [2, 1, 0]);
    assert_eq!(table.elapsed, 3);
    assert_eq!(state_of(&frames[1]), DeviceState::Done);
}
