mod support;

use std::{cell::RefCell, rc::Rc};

use rill_client::{
    ClientConfig, ContextState, Direction, Error, OperationState, StreamEvent, StreamFlags,
    StreamState,
    rill_proto::{
        format::{SampleFormat, SampleSpec},
        message::*,
    },
};
use support::*;

#[test]
fn create_reply_makes_stream_ready_and_hands_out_credit() {
    let mut h = Harness::new(13);
    let s = h.new_stream();

    h.ctx
        .connect_playback(&s, None, None, StreamFlags::NONE, None, None)
        .unwrap();
    assert_eq!(h.ctx.stream_state(&s), StreamState::Creating);

    let reply = h.playback_reply(PLAYBACK_CHANNEL, 1000);
    h.reply(h.wire.last_tag(), &reply).unwrap();

    assert_eq!(
        h.events(&s),
        [
            StreamEvent::StateChanged(StreamState::Creating),
            StreamEvent::StateChanged(StreamState::Ready),
            StreamEvent::Write(1000),
        ]
    );
    assert_eq!(h.ctx.channel(&s).unwrap(), PLAYBACK_CHANNEL);
    assert_eq!(h.ctx.stream_index(&s).unwrap(), 40 + PLAYBACK_CHANNEL);
    assert_eq!(h.ctx.device_name(&s).unwrap(), "default");
    assert_eq!(h.ctx.buffer_attr(&s).unwrap().prebuf, 100);
    assert_eq!(h.ctx.direction(&s), Direction::Playback);
    assert_eq!(h.ctx.live_streams(), 1);
}

#[test]
fn refused_create_fails_the_stream() {
    let mut h = Harness::new(13);
    let s = h.new_stream();

    h.ctx.connect_record(&s, None, None, StreamFlags::NONE).unwrap();
    h.refuse(h.wire.last_tag(), ErrorCode::NoEntity).unwrap();

    assert_eq!(h.ctx.stream_state(&s), StreamState::Failed);
    assert_eq!(h.ctx.error(), Some(ErrorCode::NoEntity));
    assert_eq!(h.ctx.state(), ContextState::Ready);
    assert_eq!(h.ctx.live_streams(), 0);
}

#[test]
fn nothing_is_reported_after_a_terminal_state() {
    let mut h = Harness::new(13);
    let s = h.playback(StreamFlags::NONE);

    let drain = h.ctx.drain(&s).unwrap();
    h.ctx.disconnect(&s).unwrap();
    h.ack(h.wire.last_tag()).unwrap();

    assert_eq!(
        h.events(&s),
        [StreamEvent::StateChanged(StreamState::Terminated)]
    );
    assert_eq!(drain.state(), OperationState::Cancelled);
    assert_eq!(h.ctx.pending_requests(), 0);

    // the channel is unbound, so this goes nowhere
    h.ctx
        .dispatch(ServerMessage::Request {
            channel: PLAYBACK_CHANNEL,
            bytes: 100,
        })
        .unwrap();
    assert_eq!(h.ctx.poll_event(&s), None);
    assert_eq!(h.ctx.write(&s, &[0; 10], 0, SeekMode::Relative).unwrap_err().code(), ErrorCode::BadState);
}

#[test]
fn killed_stream_fails() {
    let mut h = Harness::new(13);
    let s = h.record(StreamFlags::NONE);

    h.ctx
        .dispatch(ServerMessage::RecordStreamKilled {
            channel: RECORD_CHANNEL,
        })
        .unwrap();

    assert_eq!(h.ctx.stream_state(&s), StreamState::Failed);
    assert_eq!(h.ctx.error(), Some(ErrorCode::Killed));
    assert_eq!(h.events(&s), [StreamEvent::StateChanged(StreamState::Failed)]);
}

#[test]
fn malformed_frame_fails_every_stream() {
    let mut h = Harness::new(13);
    let ready = h.playback(StreamFlags::NONE);
    let unconnected = h.new_stream();

    let err = h.ctx.handle_message(&[0xff, 0xff, 0xff]).unwrap_err();
    assert!(err.is_fatal());

    assert_eq!(h.ctx.state(), ContextState::Failed);
    assert_eq!(h.ctx.error(), Some(ErrorCode::Protocol));
    assert_eq!(h.ctx.stream_state(&ready), StreamState::Failed);
    assert_eq!(h.ctx.stream_state(&unconnected), StreamState::Failed);

    // a failed connection accepts no new streams
    assert!(matches!(
        h.ctx.new_stream(Some("late"), &spec(), None, None),
        Err(Error::BadState)
    ));
}

#[test]
fn broken_transport_fails_the_connection() {
    let mut h = Harness::new(13);
    let s = h.playback(StreamFlags::NONE);

    h.wire.break_pipe();
    let err = h.ctx.cork(&s, true).unwrap_err();

    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(h.ctx.state(), ContextState::Failed);
    assert_eq!(h.ctx.error(), Some(ErrorCode::ConnectionTerminated));
    assert_eq!(h.ctx.stream_state(&s), StreamState::Failed);
}

#[test]
fn new_stream_validation() {
    let mut h = Harness::new(11);

    assert!(matches!(
        h.ctx.new_stream(None, &spec(), None, None),
        Err(Error::Invalid)
    ));

    let s32 = SampleSpec::new(SampleFormat::S32Le, 48_000, 2);
    assert!(matches!(
        h.ctx.new_stream(Some("x"), &s32, None, None),
        Err(Error::NotSupported)
    ));

    let mut props = Proplist::new();
    props.set(PROP_MEDIA_NAME, "from props");
    let s = h.ctx.new_stream(None, &spec(), None, Some(&props)).unwrap();
    assert_eq!(h.ctx.proplist(&s).unwrap().get(PROP_MEDIA_NAME), Some("from props"));

    let mut h = Harness::new(12);
    assert!(h.ctx.new_stream(Some("x"), &s32, None, None).is_ok());
}

#[test]
fn connect_validation() {
    let mut h = Harness::new(12);
    let s = h.new_stream();

    let err = h
        .ctx
        .connect_playback(&s, None, None, StreamFlags::PEAK_DETECT, None, None)
        .unwrap_err();
    assert!(matches!(err, Error::NotSupported));

    let err = h
        .ctx
        .connect_record(&s, None, None, StreamFlags::START_MUTED)
        .unwrap_err();
    assert!(matches!(err, Error::Invalid));

    let err = h
        .ctx
        .connect_playback(&s, None, None, StreamFlags::from_bits(1 << 20), None, None)
        .unwrap_err();
    assert!(matches!(err, Error::Invalid));

    // a failed validation has no side effect
    assert_eq!(h.ctx.stream_state(&s), StreamState::Unconnected);
    assert!(h.wire.commands().is_empty());

    assert!(matches!(
        h.ctx.set_monitor_stream(&s, 3),
        Err(Error::NotSupported)
    ));
}

#[test]
fn variable_rate_is_rejected_before_protocol_12() {
    let mut h = Harness::new(11);
    let s = h.new_stream();

    assert!(matches!(
        h.ctx
            .connect_playback(&s, None, None, StreamFlags::VARIABLE_RATE, None, None),
        Err(Error::NotSupported)
    ));
    assert!(h.wire.commands().is_empty());
    assert_eq!(h.ctx.stream_state(&s), StreamState::Unconnected);

    // the same stream still connects without it
    h.ctx
        .connect_playback(&s, None, None, StreamFlags::NONE, None, None)
        .unwrap();
    assert_eq!(h.ctx.stream_state(&s), StreamState::Creating);
}

#[test]
fn sync_stream_must_be_playback() {
    let mut h = Harness::new(13);
    let unconnected = h.new_stream();
    let s = h.new_stream();

    let err = h
        .ctx
        .connect_playback(&s, None, None, StreamFlags::NONE, None, Some(&unconnected))
        .unwrap_err();
    assert!(matches!(err, Error::Invalid));

    let leader = h.playback(StreamFlags::NONE);
    h.ctx
        .connect_playback(&s, None, None, StreamFlags::NONE, None, Some(&leader))
        .unwrap();

    let (_, Command::CreatePlaybackStream(create)) = h.wire.last_command() else {
        panic!("expected a create command");
    };
    let (_, first) = h.wire.commands()[0].clone();
    let Command::CreatePlaybackStream(first) = first else {
        panic!("expected a create command");
    };
    assert_eq!(create.sync_id, first.sync_id);
}

#[test]
fn monitor_stream_is_sent_with_record_create() {
    let mut h = Harness::new(13);
    let s = h.new_stream();

    h.ctx.set_monitor_stream(&s, 5).unwrap();
    assert_eq!(h.ctx.monitor_stream(&s).unwrap(), 5);

    assert!(matches!(
        h.ctx
            .connect_playback(&s, None, None, StreamFlags::NONE, None, None),
        Err(Error::BadState)
    ));

    h.ctx.connect_record(&s, None, None, StreamFlags::NONE).unwrap();
    let (_, Command::CreateRecordStream(create)) = h.wire.last_command() else {
        panic!("expected a record create command");
    };
    assert_eq!(create.direct_on_input, Some(5));
}

#[test]
fn default_device_comes_from_config() {
    let config = ClientConfig {
        default_sink: Some("speakers".into()),
        ..ClientConfig::default()
    };
    let mut h = Harness::build(13, config, false);
    let s = h.new_stream();

    h.ctx
        .connect_playback(&s, None, None, StreamFlags::NONE, None, None)
        .unwrap();

    let (_, Command::CreatePlaybackStream(create)) = h.wire.last_command() else {
        panic!("expected a create command");
    };
    assert_eq!(create.sink_name.as_deref(), Some("speakers"));
    assert_eq!(create.name, None);
    assert!(create.extension.is_some());
}

#[test]
fn zero_buffer_fields_get_defaults_before_protocol_13() {
    let mut h = Harness::new(12);
    let s = h.new_stream();

    let attr = BufferAttr {
        tlength: 500,
        ..BufferAttr::default()
    };
    h.ctx
        .connect_playback(&s, None, Some(&attr), StreamFlags::NONE, None, None)
        .unwrap();

    let (_, Command::CreatePlaybackStream(create)) = h.wire.last_command() else {
        panic!("expected a create command");
    };
    assert_eq!(create.maxlength, 4 * 1024 * 1024);
    assert_eq!(create.tlength, 500);
    assert_eq!(create.minreq, 100);
    assert_eq!(create.prebuf, 500);
    assert_eq!(create.name.as_deref(), Some("test"));
    assert!(create.extension.is_none());

    // a newer server picks its own defaults
    let mut h = Harness::new(13);
    let s = h.new_stream();
    h.ctx
        .connect_playback(&s, None, Some(&attr), StreamFlags::NONE, None, None)
        .unwrap();

    let (_, Command::CreatePlaybackStream(create)) = h.wire.last_command() else {
        panic!("expected a create command");
    };
    assert_eq!(create.maxlength, 0);
    assert_eq!(create.minreq, 0);
}

#[test]
fn device_info_is_gated_on_protocol_12() {
    let mut h = Harness::new(11);
    let s = h.playback(StreamFlags::NONE);

    assert!(h.ctx.buffer_attr(&s).is_ok());
    assert!(matches!(h.ctx.device_index(&s), Err(Error::NotSupported)));
    assert!(matches!(h.ctx.is_suspended(&s), Err(Error::NotSupported)));

    let mut h = Harness::new(12);
    let s = h.playback(StreamFlags::NONE);
    assert_eq!(h.ctx.device_index(&s).unwrap(), 0);
    assert!(!h.ctx.is_suspended(&s).unwrap());
}

#[test]
fn reply_missing_a_versioned_field_is_fatal() {
    let mut h = Harness::new(12);
    let s = h.new_stream();
    h.ctx
        .connect_playback(&s, None, None, StreamFlags::NONE, None, None)
        .unwrap();

    let mut reply = h.playback_reply(PLAYBACK_CHANNEL, 0);
    reply.device = None;

    let err = h.reply(h.wire.last_tag(), &reply).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(h.ctx.state(), ContextState::Failed);
    assert_eq!(h.ctx.stream_state(&s), StreamState::Failed);
}

#[test]
fn device_binding_must_respect_fix_flags() {
    let mut h = Harness::new(13);
    let s = h.new_stream();
    h.ctx
        .connect_playback(&s, None, None, StreamFlags::NONE, None, None)
        .unwrap();

    let mut reply = h.playback_reply(PLAYBACK_CHANNEL, 0);
    if let Some(device) = reply.device.as_mut() {
        device.sample_spec.rate = 2000;
    }
    assert!(h.reply(h.wire.last_tag(), &reply).is_err());
    assert_eq!(h.ctx.state(), ContextState::Failed);

    let mut h = Harness::new(13);
    let s = h.new_stream();
    h.ctx
        .connect_playback(&s, None, None, StreamFlags::FIX_RATE, None, None)
        .unwrap();

    let mut reply = h.playback_reply(PLAYBACK_CHANNEL, 0);
    if let Some(device) = reply.device.as_mut() {
        device.sample_spec.rate = 2000;
    }
    h.reply(h.wire.last_tag(), &reply).unwrap();
    assert_eq!(h.ctx.sample_spec(&s).unwrap().rate, 2000);
}

#[test]
fn move_for_unknown_channel_is_ignored() {
    let mut h = Harness::new(13);
    let s = h.playback(StreamFlags::NONE);

    h.ctx
        .dispatch(ServerMessage::PlaybackStreamMoved(StreamMoved {
            channel: 99,
            device_index: 3,
            device_name: Some("elsewhere".into()),
            suspended: false,
            buffer_attr: Some(MovedBufferAttr::Playback {
                attr: PlaybackBufferAttr {
                    maxlength: 1,
                    tlength: 1,
                    prebuf: 1,
                    minreq: 1,
                },
                configured_usec: 0,
            }),
        }))
        .unwrap();

    assert_eq!(h.ctx.state(), ContextState::Ready);
    assert_eq!(h.ctx.poll_event(&s), None);
    assert_eq!(h.ctx.device_name(&s).unwrap(), "default");
}

#[test]
fn move_rebinds_the_stream() {
    let mut h = Harness::new(13);
    let s = h.playback(StreamFlags::NONE);

    h.ctx
        .dispatch(ServerMessage::PlaybackStreamMoved(StreamMoved {
            channel: PLAYBACK_CHANNEL,
            device_index: 3,
            device_name: Some("elsewhere".into()),
            suspended: true,
            buffer_attr: Some(MovedBufferAttr::Playback {
                attr: PlaybackBufferAttr {
                    maxlength: 8192,
                    tlength: 400,
                    prebuf: 0,
                    minreq: 80,
                },
                configured_usec: 40_000,
            }),
        }))
        .unwrap();

    assert_eq!(h.events(&s), [StreamEvent::Moved]);
    assert_eq!(h.ctx.device_index(&s).unwrap(), 3);
    assert_eq!(h.ctx.device_name(&s).unwrap(), "elsewhere");
    assert!(h.ctx.is_suspended(&s).unwrap());
    assert_eq!(h.ctx.buffer_attr(&s).unwrap().tlength, 400);
}

#[test]
fn move_to_an_invalid_device_is_fatal() {
    let mut h = Harness::new(13);
    let s = h.playback(StreamFlags::NONE);

    let err = h
        .ctx
        .dispatch(ServerMessage::PlaybackStreamMoved(StreamMoved {
            channel: PLAYBACK_CHANNEL,
            device_index: INVALID_INDEX,
            device_name: Some("elsewhere".into()),
            suspended: false,
            buffer_attr: Some(MovedBufferAttr::Playback {
                attr: PlaybackBufferAttr {
                    maxlength: 1,
                    tlength: 1,
                    prebuf: 1,
                    minreq: 1,
                },
                configured_usec: 0,
            }),
        }))
        .unwrap_err();

    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(h.ctx.stream_state(&s), StreamState::Failed);
}

#[test]
fn notifications_below_their_protocol_floor_are_fatal() {
    let mut h = Harness::new(11);
    h.playback(StreamFlags::NONE);

    let err = h
        .ctx
        .dispatch(ServerMessage::PlaybackStreamSuspended {
            channel: PLAYBACK_CHANNEL,
            suspended: true,
        })
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    let mut h = Harness::new(12);
    h.playback(StreamFlags::NONE);
    let err = h
        .ctx
        .dispatch(ServerMessage::Started {
            channel: PLAYBACK_CHANNEL,
        })
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(h.ctx.state(), ContextState::Failed);
}

#[test]
fn suspend_and_start_are_reported() {
    let mut h = Harness::new(13);
    let s = h.playback(StreamFlags::NONE);

    h.ctx
        .dispatch(ServerMessage::PlaybackStreamSuspended {
            channel: PLAYBACK_CHANNEL,
            suspended: true,
        })
        .unwrap();
    h.ctx
        .dispatch(ServerMessage::Started {
            channel: PLAYBACK_CHANNEL,
        })
        .unwrap();
    h.ctx
        .dispatch(ServerMessage::Underflow {
            channel: PLAYBACK_CHANNEL,
        })
        .unwrap();

    assert_eq!(
        h.events(&s),
        [
            StreamEvent::Suspended,
            StreamEvent::Started,
            StreamEvent::Underflow
        ]
    );
    assert!(h.ctx.is_suspended(&s).unwrap());
}

#[test]
fn unanswered_create_times_out() {
    let mut h = Harness::new(13);
    let s = h.new_stream();
    h.ctx
        .connect_playback(&s, None, None, StreamFlags::NONE, None, None)
        .unwrap();

    let deadline = h.ctx.next_deadline().unwrap();

    h.clock.advance(1000);
    h.ctx.process_timeouts().unwrap();
    assert_eq!(h.ctx.stream_state(&s), StreamState::Creating);

    h.clock.advance(deadline);
    h.ctx.process_timeouts().unwrap();

    assert_eq!(h.ctx.stream_state(&s), StreamState::Failed);
    assert_eq!(h.ctx.error(), Some(ErrorCode::Timeout));
    assert_eq!(h.ctx.next_deadline(), None);
}

#[test]
fn upload_finishes_into_terminated() {
    let mut h = Harness::new(13);
    let s = h.new_stream();

    assert!(matches!(h.ctx.connect_upload(&s, 0), Err(Error::Invalid)));
    h.ctx.connect_upload(&s, 300).unwrap();

    let (tag, Command::CreateUploadStream(create)) = h.wire.last_command() else {
        panic!("expected an upload create command");
    };
    assert_eq!(create.length, 300);
    assert!(create.proplist.is_some());

    h.reply(
        tag,
        &CreateUploadReply {
            channel: 3,
            requested_bytes: 300,
        },
    )
    .unwrap();
    assert_eq!(h.ctx.stream_state(&s), StreamState::Ready);
    assert_eq!(h.ctx.direction(&s), Direction::Upload);
    assert_eq!(h.ctx.writable_size(&s).unwrap(), 300);

    assert!(matches!(
        h.ctx.write(&s, &[1; 10], 5, SeekMode::Relative),
        Err(Error::Invalid)
    ));
    h.ctx.write(&s, &[1; 300], 0, SeekMode::Relative).unwrap();
    assert!(matches!(h.ctx.cork(&s, true), Err(Error::BadState)));

    h.ctx.finish_upload(&s).unwrap();
    assert!(matches!(
        h.wire.last_command().1,
        Command::FinishUploadStream { channel: 3 }
    ));
    h.ack(h.wire.last_tag()).unwrap();

    assert_eq!(h.ctx.stream_state(&s), StreamState::Terminated);
}

#[test]
fn state_hook_sees_every_transition() {
    let mut h = Harness::new(13);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&seen);
    h.ctx.set_state_hook(move |_, state| log.borrow_mut().push(state));

    let s = h.playback(StreamFlags::NONE);
    h.ctx.disconnect(&s).unwrap();
    h.refuse(h.wire.last_tag(), ErrorCode::Internal).unwrap();

    assert_eq!(
        *seen.borrow(),
        [
            StreamState::Creating,
            StreamState::Ready,
            StreamState::Failed
        ]
    );
}

#[test]
fn dropped_handles_free_unlinked_streams() {
    let mut h = Harness::new(13);
    let s = h.playback(StreamFlags::NONE);
    let key = s.key();

    h.ctx.disconnect(&s).unwrap();
    h.ack(h.wire.last_tag()).unwrap();
    drop(s);

    // freed on the next sweep
    h.new_stream();
    let other = h.new_stream();
    assert_ne!(other.key(), key);
    assert_eq!(h.ctx.live_streams(), 0);
}
