//! 会话事件路由
//!
//! 两个传输实现共用：记录每个会话当前的事件接收端，接收端缺席时暂存完成事件。

use std::collections::VecDeque;

use dashmap::DashMap;
use tracing::{debug, trace};

use super::{EventSink, TransportEvent};

#[derive(Default)]
struct HubSession {
    sink: Option<EventSink>,
    /// 无接收端期间的完成事件
    backlog: VecDeque<TransportEvent>,
}

#[derive(Default)]
pub(crate) struct SessionHub {
    sessions: DashMap<String, HubSession>,
}

impl SessionHub {
    /// 绑定接收端并重放暂存事件，返回重放数量
    pub(crate) fn attach(&self, session_id: &str, sink: EventSink) -> usize {
        let mut session = self.sessions.entry(session_id.to_string()).or_default();

        let backlog = std::mem::take(&mut session.backlog);
        let mut replayed = 0;
        for event in backlog {
            match sink.send(event) {
                Ok(()) => replayed += 1,
                Err(e) => session.backlog.push_back(e.0),
            }
        }

        session.sink = Some(sink);

        if replayed > 0 {
            debug!("会话 {} 重放了 {} 个完成事件", session_id, replayed);
        }
        replayed
    }

    pub(crate) fn detach(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.sink = None;
        }
    }

    pub(crate) fn is_attached(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map_or(false, |s| s.sink.as_ref().map_or(false, |sink| !sink.is_closed()))
    }

    /// 暂存的完成事件数量
    pub(crate) fn backlog_len(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, |s| s.backlog.len())
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let mut session = self.sessions.entry(event.session_id.clone()).or_default();

        let undelivered = match &session.sink {
            Some(sink) => sink.send(event).err().map(|e| e.0),
            None => Some(event),
        };

        let Some(event) = undelivered else {
            return;
        };

        // 接收端已关闭（所属进程/管理器已退出）
        if session.sink.is_some() {
            session.sink = None;
        }

        if event.is_completion() {
            debug!(
                "会话 {} 无接收端，暂存完成事件: task_id={}",
                event.session_id, event.task_id
            );
            session.backlog.push_back(event);
        } else {
            trace!("会话 {} 无接收端，丢弃事件: task_id={}", event.session_id, event.task_id);
        }
    }
}
