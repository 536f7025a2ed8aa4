//! 上传事件
//!
//! 会话按发生顺序发出事件，`EventSink` 把事件分发给所有订阅者。
//! 订阅者各自持有一个无界通道，接收端被丢弃后在下一次分发时移除。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

/// 上传事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 开始上传
    FileStart {
        file_name: String,
        total_chunks: usize,
    },
    /// 进度更新
    FileProgress {
        file_name: String,
        /// 百分比，保留两位小数
        progress: f64,
        /// 本次运行的平均速度（MB/s）
        speed: f64,
        /// 预计剩余时间（秒）
        eta: f64,
    },
    /// 上传完成
    FileComplete { file_name: String },
    /// 上传失败
    Error { file_name: String, error: String },
    /// 已暂停
    FilePaused { file_name: String },
    /// 已恢复
    FileResumed { file_name: String },
    /// 已取消
    FileCancelled { file_name: String },
}

impl UploadEvent {
    pub fn file_name(&self) -> &str {
        match self {
            UploadEvent::FileStart { file_name, .. } => file_name,
            UploadEvent::FileProgress { file_name, .. } => file_name,
            UploadEvent::FileComplete { file_name } => file_name,
            UploadEvent::Error { file_name, .. } => file_name,
            UploadEvent::FilePaused { file_name } => file_name,
            UploadEvent::FileResumed { file_name } => file_name,
            UploadEvent::FileCancelled { file_name } => file_name,
        }
    }

    /// 事件类型名（与序列化的 `event_type` 一致）
    pub fn event_type(&self) -> &'static str {
        match self {
            UploadEvent::FileStart { .. } => "file_start",
            UploadEvent::FileProgress { .. } => "file_progress",
            UploadEvent::FileComplete { .. } => "file_complete",
            UploadEvent::Error { .. } => "error",
            UploadEvent::FilePaused { .. } => "file_paused",
            UploadEvent::FileResumed { .. } => "file_resumed",
            UploadEvent::FileCancelled { .. } => "file_cancelled",
        }
    }
}

/// 事件分发器
#[derive(Debug, Default)]
pub struct EventSink {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<UploadEvent>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅之后发出的所有事件
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<UploadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// 分发事件
    pub fn emit(&self, event: UploadEvent) {
        trace!("事件: {} [{}]", event.event_type(), event.file_name());
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = UploadEvent::FileProgress {
            file_name: "a.bin".to_string(),
            progress: 42.86,
            speed: 1.5,
            eta: 3.0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "file_progress");
        assert_eq!(json["file_name"], "a.bin");
        assert_eq!(json["progress"], 42.86);

        let back: UploadEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);

        let json = serde_json::to_value(UploadEvent::FileComplete {
            file_name: "a.bin".to_string(),
        })
        .unwrap();
        assert_eq!(json["event_type"], "file_complete");
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let sink = EventSink::new();
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();

        sink.emit(UploadEvent::FileStart {
            file_name: "x".to_string(),
            total_chunks: 2,
        });
        sink.emit(UploadEvent::FileComplete {
            file_name: "x".to_string(),
        });

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await.unwrap().event_type(), "file_start");
            assert_eq!(rx.recv().await.unwrap().event_type(), "file_complete");
        }
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let sink = EventSink::new();
        let rx = sink.subscribe();
        let _kept = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 2);

        drop(rx);
        sink.emit(UploadEvent::FilePaused {
            file_name: "x".to_string(),
        });
        assert_eq!(sink.subscriber_count(), 1);
    }
}
