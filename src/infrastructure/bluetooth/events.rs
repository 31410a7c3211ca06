//! Event Channel
//!
//! Push-based streams over the platform event source. Every
//! [`Observable::subscribe`] installs its own platform registration; the
//! returned [`Subscription`] removes it again on [`Subscription::unsubscribe`]
//! or drop.
//!
//! All registrations are owned by one dispatch actor running on a dedicated
//! thread, so installing and removing them never happens on the caller's
//! thread, whichever thread that is.

use crate::infrastructure::bluetooth::platform::{
    EventFilter, PlatformEvent, PlatformEventSource, PlatformReceiver, RegistrationId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum DispatchCommand {
    Register {
        id: SubscriptionId,
        filter: EventFilter,
        receiver: PlatformReceiver,
    },
    Unregister {
        id: SubscriptionId,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the dispatch actor. Cheap to clone; the actor stops once every
/// handle and subscription is gone, removing whatever is still registered.
#[derive(Clone)]
pub struct Dispatcher {
    commands: mpsc::UnboundedSender<DispatchCommand>,
    next_id: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Start the actor on a new thread that takes ownership of `source`
    pub fn spawn(source: Box<dyn PlatformEventSource>, thread_name: &str) -> anyhow::Result<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create dispatch runtime: {}", e);
                        return;
                    }
                };
                rt.block_on(run_dispatch_loop(source, command_rx));
            })?;

        info!("Event dispatch thread '{}' started", thread_name);

        Ok(Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn post(&self, command: DispatchCommand) {
        if self.commands.send(command).is_err() {
            warn!("Event dispatch thread is gone; command dropped");
        }
    }

    fn register(&self, filter: EventFilter, receiver: PlatformReceiver) -> Registration {
        let id = self.next_subscription_id();
        self.post(DispatchCommand::Register {
            id,
            filter,
            receiver,
        });
        Registration {
            id,
            commands: self.commands.clone(),
            active: true,
        }
    }

    /// Resolves once every command posted before this call has been applied
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(DispatchCommand::Flush { done }).is_ok() {
            let _ = wait.await;
        }
    }
}

async fn run_dispatch_loop(
    mut source: Box<dyn PlatformEventSource>,
    mut commands: mpsc::UnboundedReceiver<DispatchCommand>,
) {
    let mut registrations: HashMap<SubscriptionId, RegistrationId> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            DispatchCommand::Register {
                id,
                filter,
                receiver,
            } => {
                let registration = source.register(filter, receiver);
                debug!(?id, ?registration, "Platform registration installed");
                registrations.insert(id, registration);
            }
            DispatchCommand::Unregister { id } => match registrations.remove(&id) {
                Some(registration) => {
                    if source.unregister(registration) {
                        debug!(?id, ?registration, "Platform registration removed");
                    } else {
                        debug!(?id, ?registration, "Platform registration already gone");
                    }
                }
                None => debug!(?id, "Unregister for unknown subscription ignored"),
            },
            DispatchCommand::Flush { done } => {
                let _ = done.send(());
            }
        }
    }

    for (_, registration) in registrations.drain() {
        source.unregister(registration);
    }
    debug!("Event dispatch loop finished");
}

/// Ownership of one platform registration
pub struct Registration {
    id: SubscriptionId,
    commands: mpsc::UnboundedSender<DispatchCommand>,
    active: bool,
}

impl Registration {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Idempotent; removal itself runs on the dispatch thread
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        trace!(id = ?self.id, "Unsubscribing");
        let _ = self
            .commands
            .send(DispatchCommand::Unregister { id: self.id });
    }

    pub fn is_unsubscribed(&self) -> bool {
        !self.active
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// A live subscription. Items arrive in platform order; the stream never
/// ends on its own.
pub struct Subscription<T> {
    events: mpsc::UnboundedReceiver<T>,
    registration: Registration,
}

impl<T> Subscription<T> {
    /// Next item. Returns `None` only after [`unsubscribe`](Self::unsubscribe)
    /// once the buffered items are drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.events.try_recv().ok()
    }

    pub fn unsubscribe(&mut self) {
        self.registration.unsubscribe();
        self.events.close();
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.registration.is_unsubscribed()
    }

    pub fn id(&self) -> SubscriptionId {
        self.registration.id()
    }
}

type EventMap<T> = Arc<dyn Fn(&PlatformEvent) -> Option<T> + Send + Sync>;

/// A lazy, restartable event stream. Nothing is registered until
/// [`subscribe`](Self::subscribe) is called, and each call gets its own
/// registration.
pub struct Observable<T> {
    dispatcher: Dispatcher,
    filter: EventFilter,
    map: EventMap<T>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            filter: self.filter.clone(),
            map: self.map.clone(),
        }
    }
}

impl<T: Send + 'static> Observable<T> {
    pub(crate) fn new<F>(dispatcher: Dispatcher, filter: EventFilter, map: F) -> Self
    where
        F: Fn(&PlatformEvent) -> Option<T> + Send + Sync + 'static,
    {
        Self {
            dispatcher,
            filter,
            map: Arc::new(map),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, events) = mpsc::unbounded_channel();
        let map = self.map.clone();
        let receiver: PlatformReceiver = Arc::new(move |event: &PlatformEvent| {
            if let Some(item) = map(event) {
                let _ = tx.send(item);
            }
        });

        Subscription {
            events,
            registration: self.dispatcher.register(self.filter.clone(), receiver),
        }
    }

    /// Run `on_next` on the platform's delivery thread for every item
    pub fn subscribe_with<F>(&self, on_next: F) -> Registration
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let map = self.map.clone();
        let receiver: PlatformReceiver = Arc::new(move |event: &PlatformEvent| {
            if let Some(item) = map(event) {
                on_next(item);
            }
        });
        self.dispatcher.register(self.filter.clone(), receiver)
    }

    /// Keep only the items matching `predicate`
    pub fn filter<P>(self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let map = self.map;
        Self {
            dispatcher: self.dispatcher,
            filter: self.filter,
            map: Arc::new(move |event: &PlatformEvent| {
                map(event).filter(|item| predicate(item))
            }),
        }
    }
}
