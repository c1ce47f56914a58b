use parking_lot::Mutex;

/// 记录的历史条数。
const HISTORY_SLOTS: usize = 4;
/// 初始估计与在估计之上额外预留的字节数。
const SLACK: usize = 256;

/// 最近几次消息尺寸的滑动记录，用于为下一次写缓冲选择初始容量。
///
/// # 设计背景（Why）
/// - 编码前无法精确得知消息尺寸；每次都按上限租借浪费内存，按最小级别租借又会频繁扩容。
/// - 同一通道上的消息尺寸通常相近，取最近 4 次中的最大值再加 256 字节余量，
///   绝大多数消息一次即可写下。
///
/// # 契约说明（What）
/// - 初始 4 个槽位均为 256；
/// - [`initial_size`](Self::initial_size) 返回 `min(max(history) + 256, max_size)`；
/// - [`record`](Self::record) 以环形方式覆盖最旧的一条。
#[derive(Debug)]
pub struct AdaptiveSizeHistory {
    state: Mutex<HistoryState>,
}

#[derive(Debug)]
struct HistoryState {
    sizes: [usize; HISTORY_SLOTS],
    next: usize,
}

impl AdaptiveSizeHistory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HistoryState {
                sizes: [SLACK; HISTORY_SLOTS],
                next: 0,
            }),
        }
    }

    pub fn initial_size(&self, max_size: usize) -> usize {
        let largest = self.state.lock().sizes.iter().copied().max().unwrap_or(SLACK);
        largest.saturating_add(SLACK).min(max_size)
    }

    pub fn record(&self, size: usize) {
        let mut state = self.state.lock();
        let slot = state.next;
        state.sizes[slot] = size;
        state.next = (slot + 1) % HISTORY_SLOTS;
    }
}

impl Default for AdaptiveSizeHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_slack_and_tracks_recent_maximum() {
        let history = AdaptiveSizeHistory::new();
        assert_eq!(history.initial_size(usize::MAX), 512);
        assert_eq!(history.initial_size(300), 300);

        history.record(4000);
        assert_eq!(history.initial_size(64 * 1024), 4256);

        for _ in 0..HISTORY_SLOTS {
            history.record(100);
        }
        assert_eq!(history.initial_size(64 * 1024), 356, "旧的大尺寸应被挤出窗口");
    }
}
