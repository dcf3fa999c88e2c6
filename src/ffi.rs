//! C ABI
//!
//! 供宿主程序（JNI 层、C/C++）直接调用。进程内最多一个流，
//! 会话保存在全局 `Mutex<Option<StreamSession>>` 中，固定立体声、独占模式。
//!
//! 所有整型返回值中 `-1` 表示失败，与任何合法的帧数/计数都不冲突。
//!
//! 回调运行在引擎线程上，不得在生产者或错误回调内再调用本模块的函数
//! （会在全局锁上死锁）。
//!
//! 所有调用串行经过同一把锁：写入阻塞期间，其他线程的 close 会等到写入返回。

use std::ffi::c_void;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::audio::backend::default_backend;
use crate::audio::callback::{ErrorReporter, FrameProducer, InvalidStatus, ProducerStatus};
use crate::audio::config::{build_config, SharingMode};
use crate::audio::stream::{StreamManager, StreamSession, WriteOptions};

pub const PCM_BRIDGE_OK: i32 = 0;
pub const PCM_BRIDGE_ERROR: i32 = -1;

/// 帧生产者：填满 `frame_count` 帧交织样本，返回 0 继续、1 停止
pub type ProducerFn = extern "C" fn(
    user: *mut c_void,
    buffer: *mut i16,
    frame_count: i32,
    underrun_delta: i32,
) -> u8;

/// 错误回调：收到引擎错误码
pub type ErrorFn = extern "C" fn(user: *mut c_void, code: i32);

static SESSION: Mutex<Option<StreamSession>> = Mutex::new(None);

fn session() -> Option<MutexGuard<'static, Option<StreamSession>>> {
    match SESSION.lock() {
        Ok(guard) => Some(guard),
        Err(e) => {
            log::error!("Session lock poisoned: {}", e);
            None
        }
    }
}

/// 宿主传入的不透明指针
#[derive(Clone, Copy)]
struct UserData(*mut c_void);

// SAFETY: 指针只原样交还给宿主，线程安全由宿主保证
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

struct RawProducer {
    produce: ProducerFn,
    user: UserData,
}

impl FrameProducer for RawProducer {
    fn produce(
        &mut self,
        buffer: &mut [i16],
        frame_count: usize,
        underrun_delta: i32,
    ) -> Result<ProducerStatus, InvalidStatus> {
        let frames = i32::try_from(frame_count).unwrap_or(i32::MAX);
        let status = (self.produce)(self.user.0, buffer.as_mut_ptr(), frames, underrun_delta);
        ProducerStatus::try_from(status)
    }
}

struct RawReporter {
    report: ErrorFn,
    user: UserData,
}

impl ErrorReporter for RawReporter {
    fn report(&self, code: i32) {
        (self.report)(self.user.0, code);
    }
}

fn manager() -> StreamManager {
    StreamManager::new(Arc::from(default_backend()))
}

/// 初始化日志（重复调用无副作用）
#[no_mangle]
pub extern "C" fn pcm_bridge_init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// 打开回调模式流
///
/// `error_fn` 可为空。
///
/// # Safety
///
/// `user` 在流关闭前必须保持有效，且可在引擎线程上使用
#[no_mangle]
pub unsafe extern "C" fn pcm_bridge_open_callback(
    producer_fn: Option<ProducerFn>,
    error_fn: Option<ErrorFn>,
    user: *mut c_void,
    sample_rate: i32,
    frames_per_burst: i32,
    buffer_capacity_frames: i32,
) -> i32 {
    let Some(produce) = producer_fn else {
        log::error!("Open rejected: no producer function");
        return PCM_BRIDGE_ERROR;
    };
    let Some(mut slot) = session() else {
        return PCM_BRIDGE_ERROR;
    };

    let user = UserData(user);
    let config = build_config(
        sample_rate,
        frames_per_burst,
        buffer_capacity_frames,
        SharingMode::Exclusive,
    );
    let producer = Box::new(RawProducer { produce, user });
    let reporter =
        error_fn.map(|report| Arc::new(RawReporter { report, user }) as Arc<dyn ErrorReporter>);

    match manager().open_callback(config, producer, reporter) {
        Ok(opened) => {
            *slot = Some(opened);
            PCM_BRIDGE_OK
        }
        Err(e) => {
            log::error!("Failed to open callback stream: {}", e);
            PCM_BRIDGE_ERROR
        }
    }
}

/// 打开写入模式流（写入无超时，一直阻塞到引擎接受）
#[no_mangle]
pub extern "C" fn pcm_bridge_open_write(
    sample_rate: i32,
    frames_per_burst: i32,
    buffer_capacity_frames: i32,
) -> i32 {
    let Some(mut slot) = session() else {
        return PCM_BRIDGE_ERROR;
    };

    let config = build_config(
        sample_rate,
        frames_per_burst,
        buffer_capacity_frames,
        SharingMode::Exclusive,
    );
    match manager().open_write(config, WriteOptions::default()) {
        Ok(opened) => {
            *slot = Some(opened);
            PCM_BRIDGE_OK
        }
        Err(e) => {
            log::error!("Failed to open write stream: {}", e);
            PCM_BRIDGE_ERROR
        }
    }
}

#[no_mangle]
pub extern "C" fn pcm_bridge_start() -> i32 {
    let Some(mut slot) = session() else {
        return PCM_BRIDGE_ERROR;
    };
    let Some(stream) = slot.as_mut() else {
        log::error!("Start called with no open stream");
        return PCM_BRIDGE_ERROR;
    };

    match stream.start() {
        Ok(()) => PCM_BRIDGE_OK,
        Err(e) => {
            log::error!("Start failed: {}", e);
            PCM_BRIDGE_ERROR
        }
    }
}

/// 写入交织样本，返回写入帧数或 -1
///
/// # Safety
///
/// `buffer` 必须指向至少 `frame_count * 2` 个 i16
#[no_mangle]
pub unsafe extern "C" fn pcm_bridge_write(buffer: *const i16, frame_count: i32) -> i32 {
    if buffer.is_null() || frame_count < 0 {
        log::error!("Write rejected: buffer {:?}, {} frames", buffer, frame_count);
        return PCM_BRIDGE_ERROR;
    }
    let Some(mut slot) = session() else {
        return PCM_BRIDGE_ERROR;
    };
    let Some(stream) = slot.as_mut() else {
        log::error!("Write called with no open stream");
        return PCM_BRIDGE_ERROR;
    };

    let frames = frame_count as usize;
    let samples = stream.config().stream_format().samples_for(frames);
    let data = std::slice::from_raw_parts(buffer, samples);

    match stream.write_frames(data, frames) {
        Ok(written) => written as i32,
        Err(e) => {
            log::error!("Write failed: {}", e);
            PCM_BRIDGE_ERROR
        }
    }
}

/// 当前 underrun 计数，或 -1
#[no_mangle]
pub extern "C" fn pcm_bridge_underrun_count() -> i32 {
    let Some(slot) = session() else {
        return PCM_BRIDGE_ERROR;
    };
    let Some(stream) = slot.as_ref() else {
        log::error!("Underrun query with no open stream");
        return PCM_BRIDGE_ERROR;
    };

    match stream.underrun_count() {
        Ok(count) => count,
        Err(e) => {
            log::warn!("Underrun query failed: {}", e);
            PCM_BRIDGE_ERROR
        }
    }
}

#[no_mangle]
pub extern "C" fn pcm_bridge_close() -> i32 {
    let Some(mut slot) = session() else {
        return PCM_BRIDGE_ERROR;
    };
    let Some(mut stream) = slot.take() else {
        log::error!("Close called with no open stream");
        return PCM_BRIDGE_ERROR;
    };

    match stream.close() {
        Ok(report) => {
            log::info!("{}", report);
            PCM_BRIDGE_OK
        }
        Err(e) => {
            log::error!("Close failed: {}", e);
            PCM_BRIDGE_ERROR
        }
    }
}
