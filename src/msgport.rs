//! Message ports (spec §4.5): named mailboxes layered on the event system
//! the same way mutexes and conds are. A port's queue holds type-erased
//! envelopes (`Box<dyn Any>`) the way [`crate::tcb::Tcb::keys`] holds
//! type-erased fiber-local values — [`MsgPort<T>`] is the one typed layer on
//! top, matching this crate's general rule that only the API edge carries
//! generics.

use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::event::{Event, EventSet, EventSource, Kind};
use crate::ring::Ring;
use crate::scheduler;
use crate::tcb::FiberId;

pub(crate) struct PortInner {
    name: Option<String>,
    owner: FiberId,
    queue: RefCell<Ring<Box<dyn Any>>>,
}

impl EventSource for PortInner {
    fn poll(&self, _waiter: FiberId) -> bool {
        !self.queue.borrow().is_empty()
    }
}

impl PortInner {
    fn push(&self, item: Box<dyn Any>) {
        self.queue.borrow_mut().push_back(item);
    }
}

thread_local! {
    static REGISTRY: RefCell<Vec<(String, Rc<PortInner>)>> = RefCell::new(Vec::new());
}

fn register(name: String, port: Rc<PortInner>) {
    REGISTRY.with(|r| r.borrow_mut().push((name, port)));
}

/// Removes `port`'s own registry entry, if it has one. Identifies the entry
/// by `Rc` identity rather than by name, so destroying one of several ports
/// sharing a name never touches the others (spec §4.5 `destroy`).
fn deregister(port: &Rc<PortInner>) {
    REGISTRY.with(|r| {
        r.borrow_mut().retain(|(_, p)| !Rc::ptr_eq(p, port));
    });
}

/// First matching wins, per spec §4.5 — the registry keeps every
/// registration (ports aren't required to have unique names), and this
/// returns whichever was registered earliest.
fn find_port(name: &str) -> Option<Rc<PortInner>> {
    REGISTRY.with(|r| {
        r.borrow()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
    })
}

/// A message, carrying its payload and an optional reply port (spec §4.5:
/// "`reply(msg)` enqueues to the message's embedded reply port"). The reply
/// port's message type is independent of this envelope's — exactly as
/// flexible as the original's untyped reply-port pointer.
pub struct Envelope<T> {
    payload: T,
    reply_to: Option<Rc<PortInner>>,
}

impl<T> Envelope<T> {
    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Enqueues `value` onto this message's reply port, if it has one.
    pub fn reply<R: 'static>(&self, value: R) -> Result<()> {
        match &self.reply_to {
            Some(port) => {
                port.push(Box::new(Envelope {
                    payload: value,
                    reply_to: None,
                }));
                Ok(())
            }
            None => Err(Error::InvalidState("message carries no reply port".into())),
        }
    }
}

/// A mailbox carrying messages of type `T`. Ports with a name are visible to
/// [`MsgPort::find`] from anywhere in the process; anonymous ports are only
/// reachable through a handle passed explicitly (e.g. as another message's
/// reply port).
pub struct MsgPort<T> {
    inner: Rc<PortInner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> MsgPort<T> {
    pub fn new(name: impl Into<Option<String>>) -> Self {
        let inner = Rc::new(PortInner {
            name: name.into(),
            owner: scheduler::current(),
            queue: RefCell::new(Ring::new()),
        });
        if let Some(n) = &inner.name {
            register(n.clone(), inner.clone());
        }
        MsgPort {
            inner,
            _marker: PhantomData,
        }
    }

    /// Looks up a previously-registered named port. The caller is
    /// responsible for matching `T` to what the port's creator actually
    /// sends; a mismatch surfaces as an `Error::InvalidState` from `get`
    /// rather than at lookup time.
    pub fn find(name: &str) -> Option<MsgPort<T>> {
        find_port(name).map(|inner| MsgPort {
            inner,
            _marker: PhantomData,
        })
    }

    pub fn owner(&self) -> FiberId {
        self.inner.owner
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn put(&self, payload: T) {
        self.inner.push(Box::new(Envelope {
            payload,
            reply_to: None,
        }));
    }

    /// Like [`put`](Self::put), attaching `reply_port` so the receiver can
    /// call [`Envelope::reply`].
    pub fn put_with_reply<R: 'static>(&self, payload: T, reply_port: &MsgPort<R>) {
        self.inner.push(Box::new(Envelope {
            payload,
            reply_to: Some(reply_port.inner.clone()),
        }));
    }

    /// Returns the head message, waiting on a `Msg` event if the queue is
    /// empty.
    pub fn get(&self) -> Result<Envelope<T>> {
        loop {
            if let Some(boxed) = self.inner.queue.borrow_mut().pop_front() {
                return boxed
                    .downcast::<Envelope<T>>()
                    .map(|b| *b)
                    .map_err(|_| Error::InvalidState("message port type mismatch".into()));
            }
            let src: Rc<dyn EventSource> = self.inner.clone();
            scheduler::wait(EventSet::single(Event::new(Kind::Msg(src))))?;
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// Removes this port from the name registry (spec §4.5 `destroy`). A
    /// port with no name was never registered, so this is a no-op for one;
    /// either way the handle is consumed and the queue drops with it once
    /// the last `Rc<PortInner>` (this one, and any outstanding reply-port
    /// reference) goes away.
    pub fn destroy(self) {
        deregister(&self.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn reset() {
        scheduler::kill();
        scheduler::init(RuntimeConfig::default());
    }

    #[test]
    fn put_then_get_round_trips_the_payload() {
        reset();
        let port: MsgPort<i32> = MsgPort::new(None);
        port.put(7);
        assert_eq!(port.pending(), 1);
        let msg = port.get().unwrap();
        assert_eq!(*msg.payload(), 7);
        scheduler::kill();
    }

    #[test]
    fn find_locates_a_named_port_and_reply_reaches_its_reply_port() {
        reset();
        let requests: MsgPort<&'static str> = MsgPort::new("echo".to_string());
        let replies: MsgPort<&'static str> = MsgPort::new(None);

        let found: MsgPort<&'static str> = MsgPort::find("echo").expect("registered port");
        found.put_with_reply("ping", &replies);

        let msg = requests.get().unwrap();
        assert_eq!(*msg.payload(), "ping");
        msg.reply("pong").unwrap();

        let reply = replies.get().unwrap();
        assert_eq!(*reply.payload(), "pong");
        scheduler::kill();
    }

    #[test]
    fn destroy_removes_the_port_from_the_registry() {
        reset();
        let port: MsgPort<i32> = MsgPort::new("scratch".to_string());
        assert!(MsgPort::<i32>::find("scratch").is_some());
        port.destroy();
        assert!(MsgPort::<i32>::find("scratch").is_none());
        scheduler::kill();
    }

    #[test]
    fn get_blocks_until_a_message_arrives() {
        reset();
        let port: MsgPort<i32> = MsgPort::new(None);
        let sender = port.inner.clone();

        scheduler::spawn_fiber(
            "sender".into(),
            crate::priority_queue::PRIO_MIN,
            64 * 1024,
            Box::new(move || {
                sender.push(Box::new(Envelope {
                    payload: 99i32,
                    reply_to: None,
                }));
            }),
            false,
        );

        let msg = port.get().unwrap();
        assert_eq!(*msg.payload(), 99);
        scheduler::kill();
    }
}
