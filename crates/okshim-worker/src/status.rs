//! 워커 → 셸 상태 채널.
//!
//! 이벤트 종별마다 깊이 1의 최신 우선 슬롯(`tokio::sync::watch`)을 둔다.
//! 수신자가 밀려도 송신자는 절대 블록되지 않고, UI는 항상 종별별
//! 최신 상태만 본다.

use okshim_core::models::event::{EventKind, StatusEvent};
use tokio::sync::watch;
use tracing::trace;

/// 종별 슬롯 묶음
struct Slots<T> {
    status: T,
    matched: T,
    click: T,
    error: T,
    perf: T,
}

/// 송신측 상태 채널
pub struct StatusChannel {
    tx: Slots<watch::Sender<Option<StatusEvent>>>,
}

/// 수신측 — 종별별 최신 이벤트 구독
pub struct StatusReceiver {
    rx: Slots<watch::Receiver<Option<StatusEvent>>>,
}

/// 채널 쌍 생성
pub fn channel() -> (StatusChannel, StatusReceiver) {
    let (s_tx, s_rx) = watch::channel(None);
    let (m_tx, m_rx) = watch::channel(None);
    let (c_tx, c_rx) = watch::channel(None);
    let (e_tx, e_rx) = watch::channel(None);
    let (p_tx, p_rx) = watch::channel(None);
    (
        StatusChannel {
            tx: Slots {
                status: s_tx,
                matched: m_tx,
                click: c_tx,
                error: e_tx,
                perf: p_tx,
            },
        },
        StatusReceiver {
            rx: Slots {
                status: s_rx,
                matched: m_rx,
                click: c_rx,
                error: e_rx,
                perf: p_rx,
            },
        },
    )
}

impl StatusChannel {
    /// 이벤트 발행 — 해당 종별 슬롯을 덮어쓴다. 블록 없음.
    pub fn emit(&self, event: StatusEvent) {
        trace!(kind = ?event.kind(), "상태 이벤트 발행");
        let tx = match event.kind() {
            EventKind::Status => &self.tx.status,
            EventKind::Match => &self.tx.matched,
            EventKind::Click => &self.tx.click,
            EventKind::Error => &self.tx.error,
            EventKind::Perf => &self.tx.perf,
        };
        let _ = tx.send(Some(event));
    }
}

impl StatusReceiver {
    /// 아무 종별이든 새 이벤트가 올 때까지 대기, 그 종별의 최신값 반환.
    ///
    /// 모든 송신자가 닫히면 None.
    pub async fn changed(&mut self) -> Option<StatusEvent> {
        tokio::select! {
            r = self.rx.status.changed() => r.ok().and_then(|_| self.rx.status.borrow_and_update().clone()),
            r = self.rx.matched.changed() => r.ok().and_then(|_| self.rx.matched.borrow_and_update().clone()),
            r = self.rx.click.changed() => r.ok().and_then(|_| self.rx.click.borrow_and_update().clone()),
            r = self.rx.error.changed() => r.ok().and_then(|_| self.rx.error.borrow_and_update().clone()),
            r = self.rx.perf.changed() => r.ok().and_then(|_| self.rx.perf.borrow_and_update().clone()),
        }
    }

    /// 종별별 최신 이벤트 (소비 표시 없이 엿보기)
    pub fn latest(&self, kind: EventKind) -> Option<StatusEvent> {
        let rx = match kind {
            EventKind::Status => &self.rx.status,
            EventKind::Match => &self.rx.matched,
            EventKind::Click => &self.rx.click,
            EventKind::Error => &self.rx.error,
            EventKind::Perf => &self.rx.perf,
        };
        rx.borrow().clone()
    }
}
