use integration_tests::prelude::*;

fn enabled_drive(node_id: u8) -> (Bench, Drive) {
    let (mut bench, mut drive) = Bench::with_drive(node_id);
    bench.link.drive_mut(node_id).status_word = 0x0021;
    bench.link.drive_mut(node_id).queue_status();
    bench.link.process(0);
    bench.tick(&mut drive);
    bench.run_to_done(&mut drive, |drive, router| drive.enable(router));
    (bench, drive)
}

#[test]
fn profile_position_move_end_to_end() {
    let (mut bench, mut drive) = enabled_drive(1);

    bench.run_to_done(&mut drive, |drive, router| {
        drive.set_profile(router, 4000, 4000, 1500, 0)
    });
    assert_eq!(
        Some(&1500),
        bench.link.drive_mut(1).objects.get(&(0x6081, 0))
    );

    bench.run_to_done(&mut drive, |drive, router| {
        drive.start_abs_move(router, 50000, true)
    });
    assert_eq!(1, bench.link.drive_mut(1).op_mode);
    assert_eq!(
        Some(&50000),
        bench.link.drive_mut(1).objects.get(&(0x607A, 0))
    );
    // The start bit went out with the immediate flag and was taken back
    let cws = bench.link.drive_mut(1).received_cws.clone();
    assert!(cws.contains(&0x003F));
    assert_eq!(Some(&0x000F), cws.last());

    let state = bench.run(&mut drive, |drive, router| drive.is_in_pos(router));
    assert_eq!(DriveState::Done, state);
    assert_ne!(0, drive.status_word() & status_bits::TARGET_REACHED);
}

#[test]
fn relative_move_raises_the_relative_bit() {
    let (mut bench, mut drive) = enabled_drive(1);

    bench.run_to_done(&mut drive, |drive, router| {
        drive.start_rel_move(router, -2500, false)
    });
    assert_eq!(
        Some(&((-2500i32) as u32)),
        bench.link.drive_mut(1).objects.get(&(0x607A, 0))
    );
    assert!(bench.link.drive_mut(1).received_cws.contains(&0x005F));
}

#[test]
fn in_position_wait_works_without_broadcasts() {
    let (mut bench, mut drive) = Bench::with_drive(1);
    // Net mode: the drive never volunteers its status word
    bench.link.drive_mut(1).broadcast_status = false;
    bench.link.drive_mut(1).status_word = 0x0021;
    bench.link.drive_mut(1).move_duration_ms = 60;

    bench.run_to_done(&mut drive, |drive, router| drive.enable(router));
    bench.run_to_done(&mut drive, |drive, router| {
        drive.start_abs_move(router, 1000, false)
    });
    let state = bench.run(&mut drive, |drive, router| drive.is_in_pos(router));
    assert_eq!(DriveState::Done, state);
    assert_ne!(0, drive.status_word() & status_bits::TARGET_REACHED);
}

#[test]
fn move_at_speed_switches_mode_and_sets_the_target() {
    let (mut bench, mut drive) = enabled_drive(1);

    bench.run_to_done(&mut drive, |drive, router| drive.move_at_speed(router, 2500));
    assert_eq!(3, bench.link.drive_mut(1).op_mode);
    assert_eq!(3, drive.op_mode());
    assert_eq!(
        Some(&2500),
        bench.link.drive_mut(1).objects.get(&(0x60FF, 0))
    );
}

#[test]
fn homing_end_to_end() {
    let (mut bench, mut drive) = enabled_drive(1);

    bench.run_to_done(&mut drive, |drive, router| drive.configure_homing(router, 17));
    assert_eq!(
        Some(&17),
        bench.link.drive_mut(1).objects.get(&(0x6098, 0))
    );

    let state = bench.run(&mut drive, |drive, router| drive.do_homing(router, 5000));
    assert_eq!(DriveState::Done, state);
    assert_eq!(6, bench.link.drive_mut(1).op_mode);
    assert_eq!(
        status_bits::HOMING_FINISHED_MASK,
        drive.status_word() & status_bits::HOMING_FINISHED_MASK
    );
}

#[test]
fn homing_that_never_finishes_times_out() {
    let (mut bench, mut drive) = enabled_drive(1);
    bench.link.drive_mut(1).homing_duration_ms = 60_000;

    let state = bench.run(&mut drive, |drive, router| drive.do_homing(router, 200));
    assert_eq!(DriveState::Timeout, state);
    drive.reset_com_state(&mut bench.router);
}
