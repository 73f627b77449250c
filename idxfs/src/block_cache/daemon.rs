//! 块缓存的后台线程
//!
//! - 写回守护线程：每隔固定周期调用 [`BufferCache::write_back_all`]；
//! - 预读线程：队列为空时在条件变量上睡眠，被唤醒后调入请求的扇区。

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::BufferCache;
use crate::Result;

/// 运行中的后台线程，释放时停止并回收它们
#[derive(Debug)]
pub struct Daemons {
    cache: Arc<BufferCache>,
    /// 丢弃发送端即通知写回线程退出
    stop: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Daemons {
    pub fn spawn(cache: &Arc<BufferCache>, interval: Duration, read_ahead: bool) -> Result<Self> {
        let (stop, stopped) = mpsc::channel();
        let mut daemons = Self {
            cache: Arc::clone(cache),
            stop: Some(stop),
            workers: Vec::with_capacity(2),
        };

        let write_back_cache = Arc::clone(cache);
        daemons.workers.push(
            thread::Builder::new()
                .name("idxfs-write-back".into())
                .spawn(move || write_back(&write_back_cache, interval, stopped))?,
        );

        if read_ahead {
            cache.start_read_ahead();
            let read_ahead_cache = Arc::clone(cache);
            daemons.workers.push(
                thread::Builder::new()
                    .name("idxfs-read-ahead".into())
                    .spawn(move || read_ahead_worker(&read_ahead_cache))?,
            );
        }

        Ok(daemons)
    }

    /// 停止后台线程并等待它们退出
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        self.cache.stop_read_ahead();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("buffer cache worker panicked");
            }
        }
    }
}

impl Drop for Daemons {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_back(cache: &BufferCache, interval: Duration, stopped: Receiver<()>) {
    log::debug!("write-back daemon started, interval={interval:?}");
    while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
        let flushed = cache.write_back_all();
        if flushed > 0 {
            log::trace!("write-back daemon flushed {flushed} sectors");
        }
    }
    log::debug!("write-back daemon stopped");
}

fn read_ahead_worker(cache: &BufferCache) {
    log::debug!("read-ahead worker started");
    while let Some(sector) = cache.next_read_ahead() {
        if let Err(err) = cache.prefetch(sector) {
            log::warn!("read-ahead of {sector} failed: {err}");
        }
    }
    log::debug!("read-ahead worker stopped");
}
