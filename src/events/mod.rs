//! Update records and the watch-channel plumbing.
//!
//! Every successful mutation compiles a list of [`Update`] records and fans
//! them out to subscribed sessions. A subscription is a bounded channel of
//! [`QueueItem`]s; the `Quit` sentinel terminates the consumer stream, so
//! unwatching or closing a session ends the stream within one dequeue.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::model::{LinkRef, LinkView, ResourceChange, ResourceGroup, ResourceRef, ResourceView};

/// Bound on each subscriber queue. Fan-out never blocks the mutation path;
/// a full queue drops the event with a warning.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Edit record for a resource group, carrying the old coordinates and the
/// replacement values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupEdit {
    pub tool_id: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub new_tool_id: String,
    #[serde(rename = "newURL")]
    pub new_url: String,
    pub new_name: String,
    pub new_version: String,
}

/// One unit of change, as delivered to watchers and accepted by the batched
/// update call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "updateType", rename_all = "camelCase")]
pub enum Update {
    AddResourceGroup {
        resource_group: ResourceGroup,
    },
    EditResourceGroup {
        edit: ResourceGroupEdit,
    },
    RemoveResourceGroup {
        tool_id: String,
        #[serde(rename = "URL")]
        url: String,
    },
    AddResource {
        resource: ResourceView,
    },
    ChangeResource {
        resource: ResourceView,
    },
    RenameResource {
        change: ResourceChange,
    },
    RemoveResource {
        resource: ResourceView,
    },
    AddLink {
        link: LinkView,
    },
    RemoveLink {
        link: LinkView,
    },
    RenameLink {
        from_res: ResourceView,
        from_res_new: ResourceView,
        to_res: ResourceView,
        to_res_new: ResourceView,
    },
    MarkLinkDirty {
        link: LinkRef,
    },
    MarkLinkClean {
        link: LinkView,
    },
    MarkInferredLinkClean {
        link: LinkView,
        source: ResourceRef,
    },
    ResourceGroupVersionChanged {
        name: String,
        tool_id: String,
        #[serde(rename = "URL")]
        url: String,
        version: String,
        new_version: String,
    },
}

/// Batch of updates delivered on the depi-wide channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepiUpdate {
    pub ok: bool,
    pub msg: String,
    pub updates: Vec<Update>,
}

impl DepiUpdate {
    pub fn new(updates: Vec<Update>) -> Self {
        Self {
            ok: true,
            msg: String::new(),
            updates,
        }
    }
}

/// Batch of updates delivered on the blackboard channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboardUpdate {
    pub ok: bool,
    pub msg: String,
    pub updates: Vec<Update>,
}

impl BlackboardUpdate {
    pub fn new(updates: Vec<Update>) -> Self {
        Self {
            ok: true,
            msg: String::new(),
            updates,
        }
    }
}

/// One dirty-link notification on the resource-group channel: the watched
/// target and the source that changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUpdateNotice {
    pub watched_resource: ResourceRef,
    pub updated_resource: ResourceRef,
}

/// Stream record wrapping resource-update notices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesUpdatedNotification {
    pub ok: bool,
    pub msg: String,
    pub updates: Vec<ResourceUpdateNotice>,
}

/// Item on a subscriber queue; `Quit` ends the stream.
#[derive(Debug, Clone)]
pub enum QueueItem<T> {
    Event(T),
    Quit,
}

pub fn watch_channel<T>() -> (mpsc::Sender<QueueItem<T>>, mpsc::Receiver<QueueItem<T>>) {
    mpsc::channel(EVENT_QUEUE_CAPACITY)
}

/// Non-blocking delivery; a full queue drops the event rather than stalling
/// the mutation that produced it.
pub fn push_event<T>(tx: &mpsc::Sender<QueueItem<T>>, event: T) {
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(QueueItem::Event(event)) {
        warn!("subscriber queue full, dropping event");
    }
}

/// Push the stream-terminating sentinel; also tolerates a full queue, where
/// closing the channel alone ends the consumer.
pub fn push_quit<T>(tx: &mpsc::Sender<QueueItem<T>>) {
    let _ = tx.try_send(QueueItem::Quit);
}
