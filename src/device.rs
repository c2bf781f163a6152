//! Hardware device adapter over the CoreAudio client HAL.
//!
//! This runs in the helper daemon — outside the audio daemon's sandbox — so
//! client HAL calls are legal. Given a device UID string it opens an IOProc
//! whose callback fires on the device's realtime thread with borrowed,
//! host-owned buffers. The CoreAudio backend only exists on macOS; elsewhere
//! `open` reports the device unavailable and the engine carries on serving
//! silence for that path.

use crate::engine::IoTick;

#[cfg(target_os = "macos")]
type BoxedCallback = Box<dyn FnMut(IoTick<'_>) + Send>;

/// A physical audio device addressed by UID.
pub struct HardwareDevice {
    uid: String,
    running: bool,
    #[cfg(target_os = "macos")]
    device_id: coreaudio_sys::AudioObjectID,
    #[cfg(target_os = "macos")]
    proc_id: Option<coreaudio_sys::AudioDeviceIOProcID>,
    #[cfg(target_os = "macos")]
    callback: Option<*mut BoxedCallback>,
}

impl Default for HardwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareDevice {
    /// An unopened device handle.
    pub fn new() -> Self {
        Self {
            uid: String::new(),
            running: false,
            #[cfg(target_os = "macos")]
            device_id: coreaudio_sys::kAudioObjectUnknown,
            #[cfg(target_os = "macos")]
            proc_id: None,
            #[cfg(target_os = "macos")]
            callback: None,
        }
    }

    /// Resolve the UID to a device. Returns `false` when absent.
    pub fn open(&mut self, uid: &str) -> bool {
        #[cfg(target_os = "macos")]
        {
            match unsafe { hal::device_for_uid(uid) } {
                Some(id) => {
                    self.device_id = id;
                    self.uid = uid.to_owned();
                    true
                }
                None => false,
            }
        }
        #[cfg(not(target_os = "macos"))]
        {
            tracing::warn!(uid, "no hardware backend on this platform");
            false
        }
    }

    /// Register and start the IOProc. The callback fires on the device's
    /// realtime thread and must not allocate, block, or take locks.
    pub fn start<F>(&mut self, callback: F) -> bool
    where
        F: FnMut(IoTick<'_>) + Send + 'static,
    {
        #[cfg(target_os = "macos")]
        {
            self.start_io(Box::new(callback))
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = callback;
            false
        }
    }

    /// Stop and destroy the IOProc. Synchronous: returns only after the HAL
    /// guarantees no further callback invocations, then frees the callback.
    pub fn stop(&mut self) {
        #[cfg(target_os = "macos")]
        self.stop_io();
        self.running = false;
    }

    /// Whether I/O callbacks are being delivered.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// UID the device was opened with.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Device nominal sample rate in Hz, or 0.0 when unavailable.
    pub fn nominal_sample_rate(&self) -> f64 {
        #[cfg(target_os = "macos")]
        {
            unsafe { hal::read_f64(self.device_id, coreaudio_sys::kAudioDevicePropertyNominalSampleRate, hal::SCOPE_GLOBAL) }
                .unwrap_or(0.0)
        }
        #[cfg(not(target_os = "macos"))]
        {
            0.0
        }
    }

    /// Per-direction hardware latency in frames.
    pub fn device_latency(&self, input: bool) -> u32 {
        #[cfg(target_os = "macos")]
        {
            unsafe {
                hal::read_u32(self.device_id, coreaudio_sys::kAudioDevicePropertyLatency, hal::direction_scope(input))
            }
            .unwrap_or(0)
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = input;
            0
        }
    }

    /// Per-direction safety offset in frames.
    pub fn safety_offset(&self, input: bool) -> u32 {
        #[cfg(target_os = "macos")]
        {
            unsafe {
                hal::read_u32(self.device_id, coreaudio_sys::kAudioDevicePropertySafetyOffset, hal::direction_scope(input))
            }
            .unwrap_or(0)
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = input;
            0
        }
    }

    /// Current I/O buffer size in frames, or 0 when unavailable.
    pub fn buffer_frame_size(&self) -> u32 {
        #[cfg(target_os = "macos")]
        {
            unsafe {
                hal::read_u32(self.device_id, coreaudio_sys::kAudioDevicePropertyBufferFrameSize, hal::SCOPE_GLOBAL)
            }
            .unwrap_or(0)
        }
        #[cfg(not(target_os = "macos"))]
        {
            0
        }
    }
}

impl Drop for HardwareDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(target_os = "macos")]
impl HardwareDevice {
    fn start_io(&mut self, callback: BoxedCallback) -> bool {
        use coreaudio_sys::*;

        if self.running || self.device_id == kAudioObjectUnknown {
            return self.running;
        }

        let client = Box::into_raw(Box::new(callback));
        let mut proc_id: AudioDeviceIOProcID = None;
        let status = unsafe {
            AudioDeviceCreateIOProcID(
                self.device_id,
                Some(io_proc),
                client.cast(),
                &mut proc_id,
            )
        };
        if status != 0 || proc_id.is_none() {
            unsafe { drop(Box::from_raw(client)) };
            tracing::warn!(uid = %self.uid, status, "AudioDeviceCreateIOProcID failed");
            return false;
        }

        let status = unsafe { AudioDeviceStart(self.device_id, proc_id) };
        if status != 0 {
            unsafe {
                AudioDeviceDestroyIOProcID(self.device_id, proc_id);
                drop(Box::from_raw(client));
            }
            tracing::warn!(uid = %self.uid, status, "AudioDeviceStart failed");
            return false;
        }

        self.proc_id = Some(proc_id);
        self.callback = Some(client);
        self.running = true;
        true
    }

    fn stop_io(&mut self) {
        use coreaudio_sys::*;

        if let Some(proc_id) = self.proc_id.take() {
            unsafe {
                AudioDeviceStop(self.device_id, proc_id);
                AudioDeviceDestroyIOProcID(self.device_id, proc_id);
            }
        }
        // Safe to free only now: destroy has returned, so the HAL will not
        // call into the trampoline again.
        if let Some(client) = self.callback.take() {
            unsafe { drop(Box::from_raw(client)) };
        }
    }
}

#[cfg(target_os = "macos")]
unsafe extern "C" fn io_proc(
    _device: coreaudio_sys::AudioObjectID,
    now: *const coreaudio_sys::AudioTimeStamp,
    input_data: *const coreaudio_sys::AudioBufferList,
    input_time: *const coreaudio_sys::AudioTimeStamp,
    output_data: *mut coreaudio_sys::AudioBufferList,
    _output_time: *const coreaudio_sys::AudioTimeStamp,
    client: *mut std::ffi::c_void,
) -> coreaudio_sys::OSStatus {
    use coreaudio_sys::*;

    let callback = unsafe { &mut *client.cast::<BoxedCallback>() };

    let host_time = unsafe {
        if !now.is_null() && (*now).mFlags & kAudioTimeStampHostTimeValid != 0 {
            (*now).mHostTime
        } else {
            0
        }
    };

    let input = unsafe {
        input_data.as_ref().and_then(|list| {
            (list.mNumberBuffers > 0).then(|| {
                let buf = &*list.mBuffers.as_ptr();
                std::slice::from_raw_parts(
                    buf.mData as *const f32,
                    (buf.mDataByteSize as usize) / size_of::<f32>(),
                )
            })
        })
    };

    let input_stamp = unsafe {
        input_time.as_ref().and_then(|ts| {
            let valid = kAudioTimeStampSampleTimeValid | kAudioTimeStampHostTimeValid;
            (ts.mFlags & valid == valid).then_some((ts.mSampleTime, ts.mHostTime))
        })
    };

    let output = unsafe {
        output_data.as_mut().and_then(|list| {
            (list.mNumberBuffers > 0).then(|| {
                let buf = &mut *list.mBuffers.as_mut_ptr();
                std::slice::from_raw_parts_mut(
                    buf.mData as *mut f32,
                    (buf.mDataByteSize as usize) / size_of::<f32>(),
                )
            })
        })
    };

    callback(IoTick {
        host_time,
        input,
        input_stamp,
        output,
    });
    0
}

#[cfg(target_os = "macos")]
pub(crate) mod hal {
    //! Thin property helpers over the raw HAL bindings.

    use std::ptr;

    use coreaudio_sys::*;

    pub const SCOPE_GLOBAL: AudioObjectPropertyScope = kAudioObjectPropertyScopeGlobal;

    // Element 0 addresses the device as a whole.
    const ELEMENT_MAIN: AudioObjectPropertyElement = 0;

    pub fn direction_scope(input: bool) -> AudioObjectPropertyScope {
        if input {
            kAudioObjectPropertyScopeInput
        } else {
            kAudioObjectPropertyScopeOutput
        }
    }

    fn address(
        selector: AudioObjectPropertySelector,
        scope: AudioObjectPropertyScope,
    ) -> AudioObjectPropertyAddress {
        AudioObjectPropertyAddress {
            mSelector: selector,
            mScope: scope,
            mElement: ELEMENT_MAIN,
        }
    }

    pub unsafe fn device_for_uid(uid: &str) -> Option<AudioObjectID> {
        let Ok(cstr) = std::ffi::CString::new(uid) else {
            return None;
        };
        let cf_uid = unsafe {
            CFStringCreateWithCString(ptr::null(), cstr.as_ptr(), kCFStringEncodingUTF8)
        };
        if cf_uid.is_null() {
            return None;
        }

        let addr = address(kAudioHardwarePropertyTranslateUIDToDevice, SCOPE_GLOBAL);
        let mut device: AudioObjectID = kAudioObjectUnknown;
        let mut size = size_of::<AudioObjectID>() as u32;
        let status = unsafe {
            AudioObjectGetPropertyData(
                kAudioObjectSystemObject,
                &addr,
                size_of::<CFStringRef>() as u32,
                (&cf_uid as *const CFStringRef).cast(),
                &mut size,
                (&mut device as *mut AudioObjectID).cast(),
            )
        };
        unsafe { CFRelease(cf_uid.cast()) };

        (status == 0 && device != kAudioObjectUnknown).then_some(device)
    }

    pub unsafe fn read_u32(
        device: AudioObjectID,
        selector: AudioObjectPropertySelector,
        scope: AudioObjectPropertyScope,
    ) -> Option<u32> {
        if device == kAudioObjectUnknown {
            return None;
        }
        let addr = address(selector, scope);
        let mut value: u32 = 0;
        let mut size = size_of::<u32>() as u32;
        let status = unsafe {
            AudioObjectGetPropertyData(
                device,
                &addr,
                0,
                ptr::null(),
                &mut size,
                (&mut value as *mut u32).cast(),
            )
        };
        (status == 0).then_some(value)
    }

    pub unsafe fn read_f64(
        device: AudioObjectID,
        selector: AudioObjectPropertySelector,
        scope: AudioObjectPropertyScope,
    ) -> Option<f64> {
        if device == kAudioObjectUnknown {
            return None;
        }
        let addr = address(selector, scope);
        let mut value: f64 = 0.0;
        let mut size = size_of::<f64>() as u32;
        let status = unsafe {
            AudioObjectGetPropertyData(
                device,
                &addr,
                0,
                ptr::null(),
                &mut size,
                (&mut value as *mut f64).cast(),
            )
        };
        (status == 0).then_some(value)
    }
}
