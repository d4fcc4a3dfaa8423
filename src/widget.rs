//! Interactive-side half of the preview node.
//!
//! A [`NodeWidget`] lives as long as its node on the canvas. It remembers the
//! references from the most recent execution only, and owns the "save" button
//! that ships them to the manual-save endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::{
    api::{ManualSaveRequest, ManualSaveResponse},
    error::SinkError,
    paths::ImageRef,
    sink::{ExecutionResult, SaveMode},
};

/// Lifecycle hooks the host graph editor invokes on a node.
#[async_trait]
pub trait NodeHooks: Send + Sync {
    fn on_created(&mut self);
    fn on_executed(&mut self, output: &ExecutionResult);
    async fn on_trigger(&self) -> TriggerOutcome;
}

pub enum SaveReply {
    Saved(Vec<String>),
    Partial(ManualSaveResponse),
    Failed { status: u16, detail: String },
}

#[async_trait]
pub trait SaveClient: Send + Sync {
    /// `Err` only for transport failures; server-side errors come back as [`SaveReply::Failed`].
    async fn manual_save(&self, req: &ManualSaveRequest) -> Result<SaveReply, SinkError>;
}

pub struct HttpSaveClient {
    client: reqwest::Client,
    url: String,
}

impl HttpSaveClient {
    /// `base` is the server root, e.g. `http://127.0.0.1:8189`.
    pub fn new(base: &str, namespace: &str) -> Self {
        let url = format!("{}{}", base.trim_end_matches('/'), crate::api::manual_save_path(namespace));
        Self { client: reqwest::Client::new(), url }
    }
}

#[async_trait]
impl SaveClient for HttpSaveClient {
    async fn manual_save(&self, req: &ManualSaveRequest) -> Result<SaveReply, SinkError> {
        let transport = |e: reqwest::Error| SinkError::Transport(e.to_string());
        let resp = self.client.post(&self.url).json(req).send().await.map_err(transport)?;
        let status = resp.status().as_u16();
        Ok(match status {
            200 => SaveReply::Saved(resp.json::<ManualSaveResponse>().await.map_err(transport)?.saved),
            207 => SaveReply::Partial(resp.json().await.map_err(transport)?),
            _ => SaveReply::Failed { status, detail: resp.text().await.unwrap_or_else(|e| e.to_string()) },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel { Info, Error }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// User-visible channel (toasts, alerts).
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Falls back to the log when no UI is attached.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => info!("{}", notice.message),
            NoticeLevel::Error => error!("{}", notice.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    NothingToSave,
    Saved(Vec<String>),
    Partial { saved: Vec<String>, failed: usize },
    Failed(String),
}

/// The node's editable inputs, read at click time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeInputs {
    pub save_mode: SaveMode,
    pub filename_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetDescriptor {
    pub name: &'static str,
    /// Whether the widget's value goes into the saved workflow document.
    pub serialize: bool,
}

pub const SAVE_BUTTON: &str = "💾 Save";

pub struct NodeWidget {
    node_id: String,
    inputs: NodeInputs,
    staged: Vec<ImageRef>,
    widgets: Vec<WidgetDescriptor>,
    client: Arc<dyn SaveClient>,
    notifier: Arc<dyn Notifier>,
}

impl NodeWidget {
    pub fn new(node_id: impl Into<String>, inputs: NodeInputs, client: Arc<dyn SaveClient>, notifier: Arc<dyn Notifier>) -> Self {
        let mut w = Self {
            node_id: node_id.into(),
            inputs,
            staged: Vec::new(),
            widgets: vec![
                WidgetDescriptor { name: "save_mode", serialize: true },
                WidgetDescriptor { name: "filename_prefix", serialize: true },
            ],
            client,
            notifier,
        };
        w.on_created();
        w
    }

    /// Rebuild a node from a saved workflow's `widgets_values`.
    pub fn restore(
        node_id: impl Into<String>,
        values: &[Value],
        client: Arc<dyn SaveClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let save_mode = values
            .first()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let filename_prefix = values.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
        Self::new(node_id, NodeInputs { save_mode, filename_prefix }, client, notifier)
    }

    pub fn inputs(&self) -> &NodeInputs { &self.inputs }
    pub fn inputs_mut(&mut self) -> &mut NodeInputs { &mut self.inputs }
    pub fn staged(&self) -> &[ImageRef] { &self.staged }
    pub fn widgets(&self) -> &[WidgetDescriptor] { &self.widgets }

    /// Values persisted with the workflow, in widget order. The save button is skipped.
    pub fn widgets_values(&self) -> Vec<Value> {
        self.widgets
            .iter()
            .filter(|w| w.serialize)
            .filter_map(|w| match w.name {
                "save_mode" => serde_json::to_value(self.inputs.save_mode).ok(),
                "filename_prefix" => Some(Value::String(self.inputs.filename_prefix.clone())),
                _ => None,
            })
            .collect()
    }

    fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        self.notifier.notify(Notice { level, message: message.into() });
    }

    pub async fn trigger(&self) -> TriggerOutcome {
        if self.staged.is_empty() {
            self.notify(NoticeLevel::Info, "No images to save yet. Run the workflow first.");
            return TriggerOutcome::NothingToSave;
        }
        let req = ManualSaveRequest { images: self.staged.clone(), filename_prefix: self.inputs.filename_prefix.clone() };

        match self.client.manual_save(&req).await {
            Ok(SaveReply::Saved(saved)) => {
                debug!(node = %self.node_id, ?saved, "manual save ok");
                TriggerOutcome::Saved(saved)
            }
            Ok(SaveReply::Partial(resp)) => {
                self.notify(
                    NoticeLevel::Error,
                    format!("Saved {} image(s), {} could not be saved", resp.saved.len(), resp.failed.len()),
                );
                debug!(node = %self.node_id, failed = ?resp.failed, "manual save partial");
                TriggerOutcome::Partial { failed: resp.failed.len(), saved: resp.saved }
            }
            Ok(SaveReply::Failed { status, detail }) => {
                self.notify(NoticeLevel::Error, format!("Manual save failed (status {status})"));
                debug!(node = %self.node_id, status, %detail, "manual save failed");
                TriggerOutcome::Failed(detail)
            }
            Err(e) => {
                self.notify(NoticeLevel::Error, "Manual save failed: could not reach the server");
                debug!(node = %self.node_id, error = %e, "manual save transport error");
                TriggerOutcome::Failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl NodeHooks for NodeWidget {
    fn on_created(&mut self) {
        if !self.widgets.iter().any(|w| w.name == SAVE_BUTTON) {
            self.widgets.push(WidgetDescriptor { name: SAVE_BUTTON, serialize: false });
        }
    }

    fn on_executed(&mut self, output: &ExecutionResult) {
        self.staged = output.images().to_vec();
        debug!(node = %self.node_id, staged = self.staged.len(), "staged buffer replaced");
    }

    async fn on_trigger(&self) -> TriggerOutcome { self.trigger().await }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::UiImages;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeClient {
        requests: Mutex<Vec<ManualSaveRequest>>,
        fail_transport: bool,
    }

    #[async_trait]
    impl SaveClient for FakeClient {
        async fn manual_save(&self, req: &ManualSaveRequest) -> Result<SaveReply, SinkError> {
            self.requests.lock().push(req.clone());
            if self.fail_transport {
                return Err(SinkError::Transport("connection refused".into()));
            }
            Ok(SaveReply::Saved(req.images.iter().map(|r| format!("/out/{}", r.filename)).collect()))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Notice>>);
    impl Notifier for Recorder {
        fn notify(&self, notice: Notice) { self.0.lock().push(notice); }
    }

    fn widget(client: Arc<FakeClient>, rec: Arc<Recorder>) -> NodeWidget {
        let inputs = NodeInputs { save_mode: SaveMode::ManualSave, filename_prefix: "cat".into() };
        NodeWidget::new("7", inputs, client, rec)
    }

    fn executed(names: &[&str]) -> ExecutionResult {
        ExecutionResult { ui: UiImages { images: names.iter().map(|n| ImageRef::temp(*n)).collect() } }
    }

    #[tokio::test]
    async fn empty_buffer_sends_nothing() {
        let (client, rec) = (Arc::new(FakeClient::default()), Arc::new(Recorder::default()));
        let w = widget(client.clone(), rec.clone());
        assert_eq!(w.trigger().await, TriggerOutcome::NothingToSave);
        assert!(client.requests.lock().is_empty());
        assert_eq!(rec.0.lock()[0].level, NoticeLevel::Info);
    }

    #[tokio::test]
    async fn execution_overwrites_buffer() {
        let (client, rec) = (Arc::new(FakeClient::default()), Arc::new(Recorder::default()));
        let mut w = widget(client.clone(), rec.clone());
        w.on_executed(&executed(&["a.png", "b.png"]));
        w.on_executed(&executed(&["c.png"]));
        w.on_trigger().await;
        let reqs = client.requests.lock();
        assert_eq!(reqs[0].images, vec![ImageRef::temp("c.png")]);
    }

    #[tokio::test]
    async fn prefix_is_read_at_click_time() {
        let (client, rec) = (Arc::new(FakeClient::default()), Arc::new(Recorder::default()));
        let mut w = widget(client.clone(), rec.clone());
        w.on_executed(&executed(&["a.png"]));
        w.inputs_mut().filename_prefix = "dog".into();
        w.trigger().await;
        assert_eq!(client.requests.lock()[0].filename_prefix, "dog");
    }

    #[tokio::test]
    async fn success_is_silent_and_mode_does_not_matter() {
        let (client, rec) = (Arc::new(FakeClient::default()), Arc::new(Recorder::default()));
        let mut w = widget(client.clone(), rec.clone());
        w.on_executed(&executed(&["a.png"]));
        w.inputs_mut().save_mode = SaveMode::AlwaysSave;
        assert_eq!(w.trigger().await, TriggerOutcome::Saved(vec!["/out/a.png".into()]));
        assert!(rec.0.lock().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_visible() {
        let client = Arc::new(FakeClient { fail_transport: true, ..Default::default() });
        let rec = Arc::new(Recorder::default());
        let mut w = widget(client, rec.clone());
        w.on_executed(&executed(&["a.png"]));
        assert!(matches!(w.trigger().await, TriggerOutcome::Failed(_)));
        assert_eq!(rec.0.lock()[0].level, NoticeLevel::Error);
    }

    #[test]
    fn save_button_exists_from_creation_and_is_not_serialized() {
        let w = widget(Arc::new(FakeClient::default()), Arc::new(Recorder::default()));
        assert!(w.widgets().iter().any(|d| d.name == SAVE_BUTTON && !d.serialize));
        assert_eq!(w.widgets_values(), vec![Value::from("Manual save"), Value::from("cat")]);
    }

    #[test]
    fn restore_round_trips_values_with_one_button() {
        let values = vec![Value::from("Manual save"), Value::from("cat")];
        let w = NodeWidget::restore("9", &values, Arc::new(FakeClient::default()), Arc::new(Recorder::default()));
        assert_eq!(w.widgets_values(), values);
        assert_eq!(w.widgets().iter().filter(|d| d.name == SAVE_BUTTON).count(), 1);
        assert!(w.staged().is_empty());
    }
}
