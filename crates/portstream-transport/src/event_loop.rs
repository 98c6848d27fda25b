//! 協調的タスクキュー
//!
//! ブラウザのタスクキュー相当。ポート間のメッセージ配送や切断通知は
//! すべて別タスクとして積まれるため、ハンドラが再入的に呼ばれることはない。

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::cell::RefCell;

type Task = Box<dyn FnOnce()>;

/// FIFO タスクキュー
#[derive(Default)]
pub struct EventLoop {
    tasks: RefCell<VecDeque<Task>>,
}

impl EventLoop {
    /// 空のキューを生成する
    pub fn new() -> Self {
        EventLoop {
            tasks: RefCell::new(VecDeque::new()),
        }
    }

    /// タスクを末尾に積む
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.tasks.borrow_mut().push_back(Box::new(task));
    }

    /// 先頭のタスクを 1 つ実行する。キューが空なら `false`
    pub fn run_once(&self) -> bool {
        // 実行中のタスクが spawn できるよう、取り出した時点で借用を解放する
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// キューが空になるまで実行し、実行したタスク数を返す
    ///
    /// 相互にエコーし続けるハンドラがあると終わらない。その場合は `run_for` を使う。
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        ran
    }

    /// 最大 `max_tasks` 個のタスクを実行する
    pub fn run_for(&self, max_tasks: usize) -> usize {
        let mut ran = 0;
        while ran < max_tasks && self.run_once() {
            ran += 1;
        }
        ran
    }

    /// 未実行のタスク数
    pub fn pending_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.borrow().is_empty()
    }
}
