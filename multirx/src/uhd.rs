//! Multi-USRP backend over the UHD C API.
//!
//! [`UhdDevice::open`] builds one multi-USRP out of several devices (one
//! `addrN` entry per device), applies the subdevice spec, clock source, sample
//! rate, per-channel tuning and gain, resets device time on the next PPS edge,
//! and opens an `sc16` receive streamer across every channel.

use std::{
    ffi::{CStr, CString},
    os::raw::{c_char, c_double, c_int, c_void},
    ptr,
    time::Duration,
};

use tracing::{info, warn};

use crate::{
    Block, Error, RxDevice, RxErrorCode, RxMetadata, StreamCmd, StreamMode, TimeSpec,
};

// UHD C API FFI bindings, only what the recorder uses

type UhdError = c_int;
const UHD_ERROR_NONE: UhdError = 0;

type UhdUsrpHandle = *mut c_void;
type UhdRxStreamerHandle = *mut c_void;
type UhdRxMetadataHandle = *mut c_void;
type UhdSubdevSpecHandle = *mut c_void;

const UHD_TUNE_REQUEST_POLICY_AUTO: c_int = 65;

const UHD_STREAM_MODE_START_CONTINUOUS: c_int = 97;
const UHD_STREAM_MODE_STOP_CONTINUOUS: c_int = 111;
const UHD_STREAM_MODE_NUM_SAMPS_AND_DONE: c_int = 100;

const ALL_MBOARDS: usize = usize::MAX;

#[repr(C)]
struct UhdTuneRequest {
    target_freq: c_double,
    rf_freq_policy: c_int,
    rf_freq: c_double,
    dsp_freq_policy: c_int,
    dsp_freq: c_double,
    args: *mut c_char,
}

#[repr(C)]
struct UhdTuneResult {
    clipped_rf_freq: c_double,
    target_rf_freq: c_double,
    actual_rf_freq: c_double,
    target_dsp_freq: c_double,
    actual_dsp_freq: c_double,
}

#[repr(C)]
struct UhdStreamArgs {
    cpu_format: *mut c_char,
    otw_format: *mut c_char,
    args: *mut c_char,
    channel_list: *mut usize,
    n_channels: c_int,
}

#[repr(C)]
struct UhdStreamCmd {
    stream_mode: c_int,
    num_samps: usize,
    stream_now: bool,
    time_spec_full_secs: i64,
    time_spec_frac_secs: c_double,
}

#[link(name = "uhd")]
unsafe extern "C" {
    fn uhd_set_thread_priority(priority: f32, realtime: bool) -> UhdError;

    fn uhd_usrp_make(h: *mut UhdUsrpHandle, args: *const c_char) -> UhdError;
    fn uhd_usrp_free(h: *mut UhdUsrpHandle) -> UhdError;
    fn uhd_usrp_set_rx_subdev_spec(
        h: UhdUsrpHandle,
        subdev_spec: UhdSubdevSpecHandle,
        mboard: usize,
    ) -> UhdError;
    fn uhd_usrp_set_clock_source(
        h: UhdUsrpHandle,
        clock_source: *const c_char,
        mboard: usize,
    ) -> UhdError;
    fn uhd_usrp_set_time_unknown_pps(h: UhdUsrpHandle, full_secs: i64, frac_secs: c_double)
    -> UhdError;
    fn uhd_usrp_get_time_now(
        h: UhdUsrpHandle,
        mboard: usize,
        full_secs_out: *mut i64,
        frac_secs_out: *mut c_double,
    ) -> UhdError;
    fn uhd_usrp_get_rx_num_channels(h: UhdUsrpHandle, num_channels_out: *mut usize) -> UhdError;
    fn uhd_usrp_set_rx_rate(h: UhdUsrpHandle, rate: c_double, chan: usize) -> UhdError;
    fn uhd_usrp_get_rx_rate(h: UhdUsrpHandle, chan: usize, rate_out: *mut c_double) -> UhdError;
    fn uhd_usrp_set_rx_gain(
        h: UhdUsrpHandle,
        gain: c_double,
        chan: usize,
        gain_name: *const c_char,
    ) -> UhdError;
    fn uhd_usrp_get_rx_gain(
        h: UhdUsrpHandle,
        chan: usize,
        gain_name: *const c_char,
        gain_out: *mut c_double,
    ) -> UhdError;
    fn uhd_usrp_set_rx_freq(
        h: UhdUsrpHandle,
        tune_request: *mut UhdTuneRequest,
        chan: usize,
        tune_result: *mut UhdTuneResult,
    ) -> UhdError;
    fn uhd_usrp_get_rx_stream(
        h: UhdUsrpHandle,
        stream_args: *mut UhdStreamArgs,
        h_out: UhdRxStreamerHandle,
    ) -> UhdError;

    fn uhd_subdev_spec_make(h: *mut UhdSubdevSpecHandle, markup: *const c_char) -> UhdError;
    fn uhd_subdev_spec_free(h: *mut UhdSubdevSpecHandle) -> UhdError;

    fn uhd_rx_streamer_make(h: *mut UhdRxStreamerHandle) -> UhdError;
    fn uhd_rx_streamer_free(h: *mut UhdRxStreamerHandle) -> UhdError;
    fn uhd_rx_streamer_max_num_samps(
        h: UhdRxStreamerHandle,
        max_num_samps_out: *mut usize,
    ) -> UhdError;
    fn uhd_rx_streamer_recv(
        h: UhdRxStreamerHandle,
        buffs: *mut *mut c_void,
        samps_per_buff: usize,
        md: *mut UhdRxMetadataHandle,
        timeout: c_double,
        one_packet: bool,
        items_recvd: *mut usize,
    ) -> UhdError;
    fn uhd_rx_streamer_issue_stream_cmd(
        h: UhdRxStreamerHandle,
        stream_cmd: *const UhdStreamCmd,
    ) -> UhdError;

    fn uhd_rx_metadata_make(handle: *mut UhdRxMetadataHandle) -> UhdError;
    fn uhd_rx_metadata_free(handle: *mut UhdRxMetadataHandle) -> UhdError;
    fn uhd_rx_metadata_error_code(h: UhdRxMetadataHandle, error_code_out: *mut c_int) -> UhdError;
    fn uhd_rx_metadata_out_of_sequence(h: UhdRxMetadataHandle, result_out: *mut bool) -> UhdError;
    fn uhd_rx_metadata_time_spec(
        h: UhdRxMetadataHandle,
        full_secs_out: *mut i64,
        frac_secs_out: *mut c_double,
    ) -> UhdError;
    fn uhd_rx_metadata_strerror(
        h: UhdRxMetadataHandle,
        strerror_out: *mut c_char,
        strbuffer_len: usize,
    ) -> UhdError;
}

fn check(call: &'static str, code: UhdError) -> Result<(), Error> {
    if code == UHD_ERROR_NONE {
        Ok(())
    } else {
        Err(Error::Uhd { call, code })
    }
}

/// Check the results of several calls made back to back, reporting the first
/// failure.
fn check_all(results: &[(&'static str, UhdError)]) -> Result<(), Error> {
    results.iter().try_for_each(|&(call, code)| check(call, code))
}

fn c_string(s: &str) -> Result<CString, Error> {
    CString::new(s).map_err(|_| Error::InvalidParameter("string contains a NUL byte"))
}

/// Ask the OS for real-time scheduling on the calling thread.
///
/// Failure is logged and otherwise ignored; recording still works, just with
/// a higher chance of overflows.
pub fn set_thread_priority_safe() -> bool {
    // SAFETY: plain FFI call with no pointers.
    let err = unsafe { uhd_set_thread_priority(0.5, true) };
    if err != UHD_ERROR_NONE {
        warn!("Failed to set real-time thread priority (error {})", err);
        return false;
    }
    true
}

/// Per-channel setup for a [`UhdDevice`].
#[derive(Clone, Debug, PartialEq)]
pub struct UhdChannel {
    /// Device address, e.g. `addr=192.168.10.2`. The `addr=` prefix is
    /// optional.
    pub device_addr: String,
    /// Center frequency, in Hz.
    pub center_freq_hz: f64,
}

/// Setup for a [`UhdDevice`].
#[derive(Clone, Debug, PartialEq)]
pub struct UhdParams {
    /// One entry per device; channel `n` is on device `n`.
    pub channels: Vec<UhdChannel>,
    /// Receive subdevice spec, e.g. `A:0`.
    pub subdev: String,
    /// Clock source, e.g. `external`.
    pub clock_source: String,
    /// Sample rate, in samples per second.
    pub sample_rate_hz: f64,
    /// Receive gain, in dB, applied to every channel.
    pub gain_db: f64,
}

impl UhdParams {
    /// Build the multi-device address string: `addr0=...,addr1=...`.
    pub fn device_args(&self) -> String {
        self.channels
            .iter()
            .enumerate()
            .map(|(i, ch)| {
                let addr = ch
                    .device_addr
                    .strip_prefix("addr=")
                    .unwrap_or(&ch.device_addr);
                format!("addr{i}={addr}")
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A multi-USRP opened for streaming. See the [module docs][self].
pub struct UhdDevice {
    usrp: UhdUsrpHandle,
    rx: UhdRxStreamerHandle,
    md: UhdRxMetadataHandle,
    channels: usize,
    max_samps: usize,
    sample_rate: f64,
    ptrs: Vec<*mut c_void>,
}

// SAFETY: UHD handles may be used from any thread, as long as only one thread
// uses them at a time, which `&mut self` on every streaming call guarantees.
unsafe impl Send for UhdDevice {}

impl UhdDevice {
    /// Open and configure the devices, then set up a receive streamer.
    ///
    /// This blocks for about a second while waiting for a PPS edge.
    pub fn open(params: &UhdParams) -> Result<Self, Error> {
        if params.channels.is_empty() {
            return Err(Error::InvalidParameter("no USRP channels configured"));
        }
        let args = c_string(&params.device_args())?;
        info!("Creating USRPs: {}", params.device_args());

        let mut dev = Self {
            usrp: ptr::null_mut(),
            rx: ptr::null_mut(),
            md: ptr::null_mut(),
            channels: 0,
            max_samps: 0,
            sample_rate: 0.0,
            ptrs: Vec::new(),
        };

        // SAFETY: every handle is created before use, and `Drop` frees
        // whichever ones were created if we bail out early.
        unsafe {
            check("uhd_usrp_make", uhd_usrp_make(&mut dev.usrp, args.as_ptr()))?;
            check("uhd_rx_streamer_make", uhd_rx_streamer_make(&mut dev.rx))?;
            check("uhd_rx_metadata_make", uhd_rx_metadata_make(&mut dev.md))?;

            let markup = c_string(&params.subdev)?;
            let mut spec: UhdSubdevSpecHandle = ptr::null_mut();
            check("uhd_subdev_spec_make", uhd_subdev_spec_make(&mut spec, markup.as_ptr()))?;
            let res = uhd_usrp_set_rx_subdev_spec(dev.usrp, spec, ALL_MBOARDS);
            uhd_subdev_spec_free(&mut spec);
            check("uhd_usrp_set_rx_subdev_spec", res)?;

            let clock = c_string(&params.clock_source)?;
            check(
                "uhd_usrp_set_clock_source",
                uhd_usrp_set_clock_source(dev.usrp, clock.as_ptr(), ALL_MBOARDS),
            )?;

            let mut num_channels = 0usize;
            check(
                "uhd_usrp_get_rx_num_channels",
                uhd_usrp_get_rx_num_channels(dev.usrp, &mut num_channels),
            )?;
            if num_channels < params.channels.len() {
                return Err(Error::InvalidChannel {
                    channel: params.channels.len() - 1,
                    available: num_channels,
                });
            }
            dev.channels = params.channels.len();

            let gain_name = c_string("")?;
            for (chan, ch) in params.channels.iter().enumerate() {
                check(
                    "uhd_usrp_set_rx_rate",
                    uhd_usrp_set_rx_rate(dev.usrp, params.sample_rate_hz, chan),
                )?;

                let mut tune_req = UhdTuneRequest {
                    target_freq: ch.center_freq_hz,
                    rf_freq_policy: UHD_TUNE_REQUEST_POLICY_AUTO,
                    rf_freq: 0.0,
                    dsp_freq_policy: UHD_TUNE_REQUEST_POLICY_AUTO,
                    dsp_freq: 0.0,
                    args: ptr::null_mut(),
                };
                let mut tune_result = UhdTuneResult {
                    clipped_rf_freq: 0.0,
                    target_rf_freq: 0.0,
                    actual_rf_freq: 0.0,
                    target_dsp_freq: 0.0,
                    actual_dsp_freq: 0.0,
                };
                check(
                    "uhd_usrp_set_rx_freq",
                    uhd_usrp_set_rx_freq(dev.usrp, &mut tune_req, chan, &mut tune_result),
                )?;
                info!(
                    channel = chan,
                    "Tuned: RF={:.3} MHz, DSP={:.3} kHz",
                    tune_result.actual_rf_freq / 1e6,
                    tune_result.actual_dsp_freq / 1e3,
                );

                check(
                    "uhd_usrp_set_rx_gain",
                    uhd_usrp_set_rx_gain(dev.usrp, params.gain_db, chan, gain_name.as_ptr()),
                )?;
                let mut gain = 0.0;
                check(
                    "uhd_usrp_get_rx_gain",
                    uhd_usrp_get_rx_gain(dev.usrp, chan, gain_name.as_ptr(), &mut gain),
                )?;
                info!(channel = chan, "Actual RX Gain: {:.1} dB", gain);
            }

            let mut rate = 0.0;
            check(
                "uhd_usrp_get_rx_rate",
                uhd_usrp_get_rx_rate(dev.usrp, 0, &mut rate),
            )?;
            dev.sample_rate = rate;
            info!("Actual RX Rate: {:.3} Msps", rate / 1e6);

            // Line the devices' clocks up on the next PPS edge.
            check(
                "uhd_usrp_set_time_unknown_pps",
                uhd_usrp_set_time_unknown_pps(dev.usrp, 0, 0.0),
            )?;
            std::thread::sleep(Duration::from_secs(1));

            let cpu_fmt = c_string("sc16")?;
            let otw_fmt = c_string("sc16")?;
            let stream_args_str = c_string("")?;
            let mut channel_list: Vec<usize> = (0..dev.channels).collect();
            let mut stream_args = UhdStreamArgs {
                cpu_format: cpu_fmt.as_ptr() as *mut c_char,
                otw_format: otw_fmt.as_ptr() as *mut c_char,
                args: stream_args_str.as_ptr() as *mut c_char,
                channel_list: channel_list.as_mut_ptr(),
                n_channels: dev.channels as c_int,
            };
            check(
                "uhd_usrp_get_rx_stream",
                uhd_usrp_get_rx_stream(dev.usrp, &mut stream_args, dev.rx),
            )?;

            check(
                "uhd_rx_streamer_max_num_samps",
                uhd_rx_streamer_max_num_samps(dev.rx, &mut dev.max_samps),
            )?;
        }
        info!(
            channels = dev.channels,
            max_samps = dev.max_samps,
            "USRP receive streamer ready"
        );
        dev.ptrs = vec![ptr::null_mut(); dev.channels];
        Ok(dev)
    }

    fn metadata(&self) -> Result<RxMetadata, Error> {
        let mut code: c_int = 0;
        let mut oos = false;
        let mut full_secs: i64 = 0;
        let mut frac_secs: c_double = 0.0;
        // SAFETY: `md` is a live metadata handle, and the out-pointers are
        // valid locals.
        let results = unsafe {
            [
                (
                    "uhd_rx_metadata_error_code",
                    uhd_rx_metadata_error_code(self.md, &mut code),
                ),
                (
                    "uhd_rx_metadata_out_of_sequence",
                    uhd_rx_metadata_out_of_sequence(self.md, &mut oos),
                ),
                (
                    "uhd_rx_metadata_time_spec",
                    uhd_rx_metadata_time_spec(self.md, &mut full_secs, &mut frac_secs),
                ),
            ]
        };
        check_all(&results)?;
        Ok(RxMetadata {
            error_code: RxErrorCode::from_raw(code),
            out_of_sequence: oos,
            time_spec: TimeSpec {
                full_secs,
                frac_secs,
            },
        })
    }

    /// UHD's own description of the last receive call's error.
    pub fn strerror(&self) -> String {
        let mut buf = vec![0u8; 512];
        // SAFETY: `md` is live, and UHD writes a NUL-terminated string of at
        // most `buf.len()` bytes.
        unsafe {
            uhd_rx_metadata_strerror(self.md, buf.as_mut_ptr() as *mut c_char, buf.len());
            CStr::from_ptr(buf.as_ptr() as *const c_char)
                .to_string_lossy()
                .into_owned()
        }
    }
}

impl RxDevice for UhdDevice {
    fn channel_count(&self) -> usize {
        self.channels
    }

    fn max_block_size(&self) -> usize {
        self.max_samps
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn time_now(&self) -> Result<TimeSpec, Error> {
        let mut full_secs: i64 = 0;
        let mut frac_secs: c_double = 0.0;
        // SAFETY: `usrp` is live, and the out-pointers are valid locals.
        let err = unsafe { uhd_usrp_get_time_now(self.usrp, 0, &mut full_secs, &mut frac_secs) };
        check("uhd_usrp_get_time_now", err)?;
        Ok(TimeSpec {
            full_secs,
            frac_secs,
        })
    }

    fn issue_stream_cmd(&mut self, cmd: StreamCmd) -> Result<(), Error> {
        let (stream_mode, num_samps) = match cmd.mode {
            StreamMode::StartContinuous => (UHD_STREAM_MODE_START_CONTINUOUS, 0),
            StreamMode::NumSampsAndDone(n) => (
                UHD_STREAM_MODE_NUM_SAMPS_AND_DONE,
                usize::try_from(n).map_err(|_| Error::InvalidParameter("sample count too large"))?,
            ),
            StreamMode::StopContinuous => (UHD_STREAM_MODE_STOP_CONTINUOUS, 0),
        };
        let time_spec = cmd.time_spec.unwrap_or_default();
        let raw = UhdStreamCmd {
            stream_mode,
            num_samps,
            stream_now: cmd.time_spec.is_none(),
            time_spec_full_secs: time_spec.full_secs,
            time_spec_frac_secs: time_spec.frac_secs,
        };
        // SAFETY: `rx` is a live streamer and `raw` outlives the call.
        let err = unsafe { uhd_rx_streamer_issue_stream_cmd(self.rx, &raw) };
        check("uhd_rx_streamer_issue_stream_cmd", err)
    }

    fn recv(
        &mut self,
        buffs: &mut [Block],
        max_samps: usize,
        timeout: Duration,
    ) -> Result<(usize, RxMetadata), Error> {
        if buffs.len() != self.channels {
            return Err(Error::InvalidParameter(
                "need exactly one buffer per channel",
            ));
        }
        let max_samps = max_samps.min(self.max_samps);
        for (p, block) in self.ptrs.iter_mut().zip(buffs.iter_mut()) {
            *p = block.recv_region(max_samps).as_mut_ptr() as *mut c_void;
        }

        let mut num_rx: usize = 0;
        // SAFETY: every pointer in `ptrs` addresses `max_samps` writable sc16
        // samples in a block that stays borrowed for the whole call.
        let err = unsafe {
            uhd_rx_streamer_recv(
                self.rx,
                self.ptrs.as_mut_ptr(),
                max_samps,
                &mut self.md,
                timeout.as_secs_f64(),
                false,
                &mut num_rx,
            )
        };
        check("uhd_rx_streamer_recv", err)?;

        let md = self.metadata()?;
        let num_rx = num_rx.min(max_samps);
        for block in buffs.iter_mut() {
            block.truncate(num_rx);
        }
        if !matches!(
            md.error_code,
            RxErrorCode::None | RxErrorCode::Timeout | RxErrorCode::Overflow
        ) {
            warn!("UHD reports: {}", self.strerror());
        }
        Ok((num_rx, md))
    }
}

impl Drop for UhdDevice {
    fn drop(&mut self) {
        // SAFETY: each handle is freed at most once, and only if it was made.
        unsafe {
            if !self.md.is_null() {
                uhd_rx_metadata_free(&mut self.md);
            }
            if !self.rx.is_null() {
                uhd_rx_streamer_free(&mut self.rx);
            }
            if !self.usrp.is_null() {
                uhd_usrp_free(&mut self.usrp);
            }
        }
    }
}
