//! Test doubles for the clock and the radio.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tdmesh::radio::{Radio, RadioConfiguration, RecvError, RecvInfo};
use tdmesh::time::{Clock, LocalTime};

/// A clock that jumps forward on `sleep_until` and never advances on its
/// own, so tests run instantly while keeping deadline arithmetic exact.
pub struct FakeClock {
    now: Mutex<i64>,
}

impl FakeClock {
    pub fn new(start: i64) -> Arc<Self> {
        Arc::new(FakeClock {
            now: Mutex::new(start),
        })
    }

    #[allow(dead_code)]
    pub fn advance_to(&self, t: i64) {
        let mut now = self.now.lock().unwrap();
        if t > *now {
            *now = t;
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> LocalTime {
        LocalTime::new(*self.now.lock().unwrap())
    }

    fn sleep_until(&self, deadline: LocalTime) {
        self.advance_to(deadline.get());
    }
}

#[derive(Debug, Clone)]
pub struct SentFrame {
    pub bytes: Vec<u8>,
    pub when: i64,
}

#[derive(Default)]
pub struct FakeRadioState {
    pub sent: Vec<SentFrame>,
    /// Frames handed out by `recv`, with their arrival timestamps.
    pub incoming: VecDeque<(Vec<u8>, i64)>,
}

/// A radio that records transmissions and replays scripted receptions.
pub struct FakeRadio {
    pub state: Arc<Mutex<FakeRadioState>>,
}

impl FakeRadio {
    pub fn new() -> (Self, Arc<Mutex<FakeRadioState>>) {
        let state = Arc::new(Mutex::new(FakeRadioState::default()));
        (
            FakeRadio {
                state: state.clone(),
            },
            state,
        )
    }
}

impl Radio for FakeRadio {
    fn configure(&mut self, _cfg: RadioConfiguration) {}

    fn turn_on(&mut self) {}

    fn turn_off(&mut self) {}

    fn idle(&mut self) {}

    fn send_at(&mut self, frame: &[u8], when: LocalTime) {
        self.state.lock().unwrap().sent.push(SentFrame {
            bytes: frame.to_vec(),
            when: when.get(),
        });
    }

    fn recv(&mut self, buf: &mut [u8], _deadline: LocalTime) -> Result<RecvInfo, RecvError> {
        let mut state = self.state.lock().unwrap();
        match state.incoming.pop_front() {
            Some((frame, timestamp)) => {
                if frame.len() > buf.len() {
                    return Err(RecvError::TooLong);
                }
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(RecvInfo {
                    timestamp: LocalTime::new(timestamp),
                    rssi: -55,
                    size: frame.len(),
                })
            }
            None => Err(RecvError::Timeout),
        }
    }
}
