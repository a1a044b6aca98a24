//! Hole punching handshake.
//!
//! ```text
//! Idle --punch()--> Punching --PUNCH/CONNECTED--> Connected --CLOSE/close()--> Closed
//!   \______________PUNCH____________________________/
//! ```
//!
//! Only one `PUNCH` is ever sent by [`Handshake::punch`]. If the peer's NAT
//! drops it and nothing comes back, the handshake stays in `Punching` until
//! it is closed.

use crate::proto::{Message, Status};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Punching,
    Connected,
    Closed,
    Failed,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Closed | State::Failed)
    }
}

/// Which side starts the exchange. Both may be initiators at the same time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// What the owner of a handshake has to do after feeding it a message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Step {
    pub reply: Option<Message>,
    pub deliver: Option<String>,
    pub connected: bool,
    pub closed: bool,
}

#[derive(Debug)]
pub struct Handshake {
    state: State,
}

impl Default for Handshake {
    fn default() -> Self {
        Self { state: State::Idle }
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// enter `Punching`, returning the single `PUNCH` to send
    pub fn punch(&mut self) -> Option<Message> {
        match self.state {
            State::Idle => {
                self.state = State::Punching;
                Some(Message::Status(Status::Punch))
            }
            _ => None,
        }
    }

    pub fn on_message(&mut self, msg: Message) -> Step {
        let mut step = Step::default();
        if self.state.is_terminal() {
            return step;
        }

        match (self.state, msg) {
            (State::Idle | State::Punching, Message::Status(Status::Punch)) => {
                self.state = State::Connected;
                step.reply = Some(Message::Status(Status::Connected));
                step.connected = true;
            }
            (_, Message::Status(Status::Punch)) => {
                step.reply = Some(Message::Status(Status::Connected));
            }

            (State::Punching, Message::Status(Status::Connected)) => {
                self.state = State::Connected;
                step.connected = true;
            }
            (_, Message::Status(Status::Connected)) => {}

            (State::Connected | State::Punching, Message::Status(Status::Close)) => {
                self.state = State::Closed;
                step.closed = true;
            }
            (_, Message::Status(Status::Close)) => {}

            (State::Connected, Message::Msg(payload)) => step.deliver = Some(payload),
            (state, Message::Msg(_)) => {
                log::debug!("drop message received in {:?}", state);
            }
        }

        step
    }

    /// local close; returns the `CLOSE` to send best-effort, if the peer may be listening
    pub fn close(&mut self) -> Option<Message> {
        let prev = self.state;
        if prev.is_terminal() {
            return None;
        }

        self.state = State::Closed;
        match prev {
            State::Idle => None,
            _ => Some(Message::Status(Status::Close)),
        }
    }

    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = State::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn punch() -> Message {
        Message::Status(Status::Punch)
    }

    fn connected() -> Message {
        Message::Status(Status::Connected)
    }

    #[test]
    fn test_initiator_flow() {
        let mut h = Handshake::new();
        assert_eq!(h.punch(), Some(punch()));
        assert_eq!(h.state(), State::Punching);
        assert_eq!(h.punch(), None);

        let step = h.on_message(connected());
        assert!(step.connected);
        assert_eq!(step.reply, None);
        assert_eq!(h.state(), State::Connected);
    }

    #[test]
    fn test_responder_flow() {
        let mut h = Handshake::new();
        let step = h.on_message(punch());
        assert!(step.connected);
        assert_eq!(step.reply, Some(connected()));
        assert_eq!(h.state(), State::Connected);
    }

    /// feed each side what the other one emits, in a few interleavings
    #[test]
    fn test_simultaneous_open() {
        for a_first in [true, false] {
            let (mut a, mut b) = (Handshake::new(), Handshake::new());
            let mut to_a = vec![b.punch().unwrap()];
            let mut to_b = vec![a.punch().unwrap()];
            let (mut a_events, mut b_events) = (0, 0);

            let mut rounds = 0;
            while !(to_a.is_empty() && to_b.is_empty()) {
                rounds += 1;
                assert!(rounds < 10, "handshake does not settle");

                let deliver = |h: &mut Handshake, inbox: &mut Vec<Message>, events: &mut i32| {
                    let mut out = vec![];
                    for m in inbox.drain(..) {
                        let step = h.on_message(m);
                        *events += step.connected as i32;
                        out.extend(step.reply);
                    }
                    out
                };

                if a_first {
                    let out = deliver(&mut a, &mut to_a, &mut a_events);
                    to_b.extend(out);
                    let out = deliver(&mut b, &mut to_b, &mut b_events);
                    to_a.extend(out);
                } else {
                    let out = deliver(&mut b, &mut to_b, &mut b_events);
                    to_a.extend(out);
                    let out = deliver(&mut a, &mut to_a, &mut a_events);
                    to_b.extend(out);
                }
            }

            assert_eq!(a.state(), State::Connected);
            assert_eq!(b.state(), State::Connected);
            assert_eq!((a_events, b_events), (1, 1));
        }
    }

    #[test]
    fn test_connected_is_never_answered() {
        let mut h = Handshake::new();
        h.on_message(punch());
        assert_eq!(h.on_message(connected()), Step::default());

        let step = h.on_message(punch());
        assert_eq!(step.reply, Some(connected()));
        assert!(!step.connected);
    }

    #[test]
    fn test_messages_before_connected_dropped() {
        let mut h = Handshake::new();
        h.punch();
        let step = h.on_message(Message::Msg("early".into()));
        assert_eq!(step.deliver, None);

        h.on_message(connected());
        let step = h.on_message(Message::Msg("late".into()));
        assert_eq!(step.deliver.as_deref(), Some("late"));
    }

    #[test]
    fn test_stray_connected_in_idle() {
        let mut h = Handshake::new();
        h.on_message(connected());
        assert_eq!(h.state(), State::Idle);
    }

    #[test]
    fn test_close() {
        let mut h = Handshake::new();
        h.on_message(punch());
        let step = h.on_message(Message::Status(Status::Close));
        assert!(step.closed);
        assert_eq!(h.state(), State::Closed);

        assert_eq!(h.close(), None);
        assert_eq!(h.on_message(punch()), Step::default());
    }

    #[test]
    fn test_local_close() {
        let mut h = Handshake::new();
        assert_eq!(h.close(), None);

        let mut h = Handshake::new();
        h.punch();
        assert_eq!(h.close(), Some(Message::Status(Status::Close)));
        assert_eq!(h.close(), None);

        let mut h = Handshake::new();
        h.fail();
        assert_eq!(h.state(), State::Failed);
        assert_eq!(h.close(), None);
    }
}
