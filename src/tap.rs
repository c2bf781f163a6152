//! Process tap: a per-process copy of another application's audio output.
//!
//! The OS facility (macOS 14.2+) yields a tap object that has no I/O path of
//! its own; audio becomes readable only through a private aggregate device
//! wrapping the tap, on whose IOProc the callback fires. The tap is unmuted,
//! so the tapped audio keeps playing on the slave device's own outputs.
//!
//! The tap is strictly optional: `create` returning `false` (source process
//! not running, old OS, non-macOS build) leaves the engine's main paths
//! untouched.

/// Tap on one process's output to one device stream.
pub struct ProcessTap {
    running: bool,
    #[cfg(target_os = "macos")]
    state: Option<macos::TapState>,
}

impl Default for ProcessTap {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTap {
    /// An idle tap.
    pub fn new() -> Self {
        Self {
            running: false,
            #[cfg(target_os = "macos")]
            state: None,
        }
    }

    /// Create a tap on `stream_index` of the device at `device_uid`,
    /// filtered to the process whose bundle id contains `process_substring`.
    /// Returns `false` when the process or the facility is unavailable.
    pub fn create(&mut self, device_uid: &str, stream_index: u32, process_substring: &str) -> bool {
        #[cfg(target_os = "macos")]
        {
            match unsafe { macos::create(device_uid, stream_index, process_substring) } {
                Some(state) => {
                    self.state = Some(state);
                    true
                }
                None => false,
            }
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = (device_uid, stream_index, process_substring);
            false
        }
    }

    /// Start delivering tapped interleaved frames on the aggregate's I/O
    /// thread. Requires a successful [`Self::create`].
    pub fn start<F>(&mut self, callback: F) -> bool
    where
        F: FnMut(&[f32]) + Send + 'static,
    {
        #[cfg(target_os = "macos")]
        {
            if let Some(state) = self.state.as_mut() {
                if unsafe { state.start(Box::new(callback)) } {
                    self.running = true;
                }
            }
            self.running
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = callback;
            false
        }
    }

    /// Stop the I/O, destroy the aggregate and the tap.
    pub fn stop(&mut self) {
        #[cfg(target_os = "macos")]
        if let Some(mut state) = self.state.take() {
            unsafe { state.destroy() };
        }
        self.running = false;
    }

    /// Whether tapped audio is flowing.
    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for ProcessTap {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use std::ffi::{CStr, CString, c_char, c_void};
    use std::mem;
    use std::ptr;

    use coreaudio_sys::*;

    type TapCallback = Box<dyn FnMut(&[f32]) + Send>;

    const fn fourcc(code: &[u8; 4]) -> u32 {
        u32::from_be_bytes(*code)
    }

    // Selectors newer than the generated bindings.
    const PROPERTY_PROCESS_OBJECT_LIST: AudioObjectPropertySelector = fourcc(b"prs#");
    const PROPERTY_PROCESS_BUNDLE_ID: AudioObjectPropertySelector = fourcc(b"pbid");
    const PROPERTY_TAP_UID: AudioObjectPropertySelector = fourcc(b"tuid");

    // The tap API itself postdates the generated bindings as well.
    unsafe extern "C" {
        fn AudioHardwareCreateProcessTap(
            description: *mut c_void,
            out_tap: *mut AudioObjectID,
        ) -> OSStatus;
        fn AudioHardwareDestroyProcessTap(tap: AudioObjectID) -> OSStatus;
    }

    // CATapDescription is an Objective-C class; drive it through the runtime.
    #[link(name = "objc")]
    unsafe extern "C" {
        fn objc_getClass(name: *const c_char) -> *mut c_void;
        fn sel_registerName(name: *const c_char) -> *mut c_void;
        fn objc_msgSend();
    }

    unsafe fn class(name: &CStr) -> *mut c_void {
        unsafe { objc_getClass(name.as_ptr()) }
    }

    unsafe fn sel(name: &CStr) -> *mut c_void {
        unsafe { sel_registerName(name.as_ptr()) }
    }

    unsafe fn msg0(obj: *mut c_void, sel: *mut c_void) -> *mut c_void {
        let send: unsafe extern "C" fn(*mut c_void, *mut c_void) -> *mut c_void =
            unsafe { mem::transmute(objc_msgSend as usize) };
        unsafe { send(obj, sel) }
    }

    unsafe fn msg1(obj: *mut c_void, sel: *mut c_void, a: *mut c_void) -> *mut c_void {
        let send: unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void) -> *mut c_void =
            unsafe { mem::transmute(objc_msgSend as usize) };
        unsafe { send(obj, sel, a) }
    }

    unsafe fn msg3(
        obj: *mut c_void,
        sel: *mut c_void,
        a: *mut c_void,
        b: *mut c_void,
        c: usize,
    ) -> *mut c_void {
        let send: unsafe extern "C" fn(
            *mut c_void,
            *mut c_void,
            *mut c_void,
            *mut c_void,
            usize,
        ) -> *mut c_void = unsafe { mem::transmute(objc_msgSend as usize) };
        unsafe { send(obj, sel, a, b, c) }
    }

    pub(super) struct TapState {
        description: *mut c_void,
        tap_id: AudioObjectID,
        aggregate_id: AudioObjectID,
        proc_id: AudioDeviceIOProcID,
        callback: *mut TapCallback,
    }

    unsafe impl Send for TapState {}

    /// Find the audio process object whose bundle id contains `substring`.
    unsafe fn find_process(substring: &str) -> Option<AudioObjectID> {
        let addr = AudioObjectPropertyAddress {
            mSelector: PROPERTY_PROCESS_OBJECT_LIST,
            mScope: kAudioObjectPropertyScopeGlobal,
            mElement: 0,
        };
        let mut size: u32 = 0;
        let status = unsafe {
            AudioObjectGetPropertyDataSize(kAudioObjectSystemObject, &addr, 0, ptr::null(), &mut size)
        };
        if status != 0 || size == 0 {
            return None;
        }
        let count = size as usize / size_of::<AudioObjectID>();
        let mut objects = vec![kAudioObjectUnknown; count];
        let status = unsafe {
            AudioObjectGetPropertyData(
                kAudioObjectSystemObject,
                &addr,
                0,
                ptr::null(),
                &mut size,
                objects.as_mut_ptr().cast(),
            )
        };
        if status != 0 {
            return None;
        }

        let bundle_addr = AudioObjectPropertyAddress {
            mSelector: PROPERTY_PROCESS_BUNDLE_ID,
            mScope: kAudioObjectPropertyScopeGlobal,
            mElement: 0,
        };
        for object in objects {
            let mut bundle: CFStringRef = ptr::null();
            let mut cf_size = size_of::<CFStringRef>() as u32;
            let status = unsafe {
                AudioObjectGetPropertyData(
                    object,
                    &bundle_addr,
                    0,
                    ptr::null(),
                    &mut cf_size,
                    (&mut bundle as *mut CFStringRef).cast(),
                )
            };
            if status != 0 || bundle.is_null() {
                continue;
            }
            let mut buf = [0u8; 256];
            let ok = unsafe {
                CFStringGetCString(
                    bundle,
                    buf.as_mut_ptr().cast(),
                    buf.len() as CFIndex,
                    kCFStringEncodingUTF8,
                )
            };
            unsafe { CFRelease(bundle.cast()) };
            if ok == 0 {
                continue;
            }
            let Ok(text) = CStr::from_bytes_until_nul(&buf) else {
                continue;
            };
            if text.to_string_lossy().contains(substring) {
                return Some(object);
            }
        }
        None
    }

    pub(super) unsafe fn create(
        device_uid: &str,
        stream_index: u32,
        process_substring: &str,
    ) -> Option<TapState> {
        let process = unsafe { find_process(process_substring) }?;

        // [[CATapDescription alloc] initWithProcesses:@[@(process)]
        //                                andDeviceUID:uid withStream:index]
        let description = unsafe {
            let number = msg1(
                class(c"NSNumber"),
                sel(c"numberWithUnsignedInt:"),
                process as usize as *mut c_void,
            );
            let processes = msg1(class(c"NSArray"), sel(c"arrayWithObject:"), number);
            let uid_c = CString::new(device_uid).ok()?;
            let uid_ns = msg1(
                class(c"NSString"),
                sel(c"stringWithUTF8String:"),
                uid_c.as_ptr() as *mut c_void,
            );
            let alloc = msg0(class(c"CATapDescription"), sel(c"alloc"));
            msg3(
                alloc,
                sel(c"initWithProcesses:andDeviceUID:withStream:"),
                processes,
                uid_ns,
                stream_index as usize,
            )
        };
        if description.is_null() {
            return None;
        }

        let mut tap_id: AudioObjectID = kAudioObjectUnknown;
        let status = unsafe { AudioHardwareCreateProcessTap(description, &mut tap_id) };
        if status != 0 || tap_id == kAudioObjectUnknown {
            unsafe { msg0(description, sel(c"release")) };
            tracing::warn!(status, "AudioHardwareCreateProcessTap failed");
            return None;
        }

        let aggregate_id = match unsafe { create_aggregate(tap_id) } {
            Some(id) => id,
            None => {
                unsafe {
                    AudioHardwareDestroyProcessTap(tap_id);
                    msg0(description, sel(c"release"));
                }
                return None;
            }
        };

        Some(TapState {
            description,
            tap_id,
            aggregate_id,
            proc_id: None,
            callback: ptr::null_mut(),
        })
    }

    /// Taps have no I/O path of their own: build a private aggregate device
    /// that contains only the tap and read the audio from its IOProc.
    unsafe fn create_aggregate(tap_id: AudioObjectID) -> Option<AudioObjectID> {
        let tap_uid_addr = AudioObjectPropertyAddress {
            mSelector: PROPERTY_TAP_UID,
            mScope: kAudioObjectPropertyScopeGlobal,
            mElement: 0,
        };
        let mut tap_uid: CFStringRef = ptr::null();
        let mut size = size_of::<CFStringRef>() as u32;
        let status = unsafe {
            AudioObjectGetPropertyData(
                tap_id,
                &tap_uid_addr,
                0,
                ptr::null(),
                &mut size,
                (&mut tap_uid as *mut CFStringRef).cast(),
            )
        };
        if status != 0 || tap_uid.is_null() {
            return None;
        }

        unsafe {
            let cf_str = |text: &CStr| {
                CFStringCreateWithCString(ptr::null(), text.as_ptr(), kCFStringEncodingUTF8)
            };

            let sub_tap_key = cf_str(c"uid");
            let sub_tap_keys = [sub_tap_key.cast::<c_void>()];
            let sub_tap_values = [tap_uid.cast::<c_void>()];
            let sub_tap = CFDictionaryCreate(
                ptr::null(),
                sub_tap_keys.as_ptr() as *mut *const c_void,
                sub_tap_values.as_ptr() as *mut *const c_void,
                1,
                &kCFTypeDictionaryKeyCallBacks,
                &kCFTypeDictionaryValueCallBacks,
            );
            let taps = CFArrayCreate(
                ptr::null(),
                [sub_tap.cast::<c_void>()].as_ptr() as *mut *const c_void,
                1,
                &kCFTypeArrayCallBacks,
            );

            let yes: i32 = 1;
            let private = CFNumberCreate(ptr::null(), kCFNumberIntType as _, (&yes as *const i32).cast());

            let key_strings = [cf_str(c"uid"), cf_str(c"name"), cf_str(c"private"), cf_str(c"taps")];
            let uid_value = cf_str(c"com.driftlink.cue-tap-aggregate");
            let name_value = cf_str(c"driftlink cue tap");
            let keys = [
                key_strings[0].cast::<c_void>(),
                key_strings[1].cast::<c_void>(),
                key_strings[2].cast::<c_void>(),
                key_strings[3].cast::<c_void>(),
            ];
            let values = [
                uid_value.cast::<c_void>(),
                name_value.cast::<c_void>(),
                private.cast::<c_void>(),
                taps.cast::<c_void>(),
            ];
            let composition = CFDictionaryCreate(
                ptr::null(),
                keys.as_ptr() as *mut *const c_void,
                values.as_ptr() as *mut *const c_void,
                keys.len() as CFIndex,
                &kCFTypeDictionaryKeyCallBacks,
                &kCFTypeDictionaryValueCallBacks,
            );

            let mut aggregate: AudioObjectID = kAudioObjectUnknown;
            let status = AudioHardwareCreateAggregateDevice(composition, &mut aggregate);

            CFRelease(composition.cast());
            for key in key_strings {
                CFRelease(key.cast());
            }
            CFRelease(uid_value.cast());
            CFRelease(name_value.cast());
            CFRelease(private.cast());
            CFRelease(taps.cast());
            CFRelease(sub_tap.cast());
            CFRelease(sub_tap_key.cast());
            CFRelease(tap_uid.cast());

            if status != 0 || aggregate == kAudioObjectUnknown {
                tracing::warn!(status, "tap aggregate creation failed");
                return None;
            }
            Some(aggregate)
        }
    }

    impl TapState {
        pub(super) unsafe fn start(&mut self, callback: TapCallback) -> bool {
            let client = Box::into_raw(Box::new(callback));
            let mut proc_id: AudioDeviceIOProcID = None;
            let status = unsafe {
                AudioDeviceCreateIOProcID(self.aggregate_id, Some(tap_io_proc), client.cast(), &mut proc_id)
            };
            if status != 0 || proc_id.is_none() {
                unsafe { drop(Box::from_raw(client)) };
                return false;
            }
            let status = unsafe { AudioDeviceStart(self.aggregate_id, proc_id) };
            if status != 0 {
                unsafe {
                    AudioDeviceDestroyIOProcID(self.aggregate_id, proc_id);
                    drop(Box::from_raw(client));
                }
                return false;
            }
            self.proc_id = proc_id;
            self.callback = client;
            true
        }

        pub(super) unsafe fn destroy(&mut self) {
            unsafe {
                if self.proc_id.is_some() {
                    AudioDeviceStop(self.aggregate_id, self.proc_id);
                    AudioDeviceDestroyIOProcID(self.aggregate_id, self.proc_id);
                    self.proc_id = None;
                }
                if !self.callback.is_null() {
                    drop(Box::from_raw(self.callback));
                    self.callback = ptr::null_mut();
                }
                if self.aggregate_id != kAudioObjectUnknown {
                    AudioHardwareDestroyAggregateDevice(self.aggregate_id);
                    self.aggregate_id = kAudioObjectUnknown;
                }
                if self.tap_id != kAudioObjectUnknown {
                    AudioHardwareDestroyProcessTap(self.tap_id);
                    self.tap_id = kAudioObjectUnknown;
                }
                if !self.description.is_null() {
                    msg0(self.description, sel(c"release"));
                    self.description = ptr::null_mut();
                }
            }
        }
    }

    unsafe extern "C" fn tap_io_proc(
        _device: AudioObjectID,
        _now: *const AudioTimeStamp,
        input_data: *const AudioBufferList,
        _input_time: *const AudioTimeStamp,
        _output_data: *mut AudioBufferList,
        _output_time: *const AudioTimeStamp,
        client: *mut c_void,
    ) -> OSStatus {
        let callback = unsafe { &mut *client.cast::<TapCallback>() };
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
        if let Some(frames) = input {
            callback(frames);
        }
        0
    }
}
