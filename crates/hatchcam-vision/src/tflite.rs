use anyhow::{Context, Result};
use image::imageops::FilterType;
use std::{ffi::CString, os::raw::{c_char, c_int, c_void}, ptr};
use tracing::{debug, info};

use crate::{engine::{postprocess_ssd, Letterbox}, Detection, Detector, Frame, VisionConfig};

#[repr(C)]
struct TfLiteModel;
#[repr(C)]
struct TfLiteInterpreterOptions;
#[repr(C)]
struct TfLiteInterpreter;
#[repr(C)]
struct TfLiteTensor;
#[repr(C)]
struct TfLiteDelegate;

#[link(name = "tensorflowlite_c")]
extern "C" {
    fn TfLiteModelCreateFromFile(model_path: *const c_char) -> *mut TfLiteModel;
    fn TfLiteModelDelete(model: *mut TfLiteModel);

    fn TfLiteInterpreterOptionsCreate() -> *mut TfLiteInterpreterOptions;
    fn TfLiteInterpreterOptionsDelete(options: *mut TfLiteInterpreterOptions);
    fn TfLiteInterpreterOptionsSetNumThreads(options: *mut TfLiteInterpreterOptions, num_threads: c_int);
    fn TfLiteInterpreterOptionsAddDelegate(options: *mut TfLiteInterpreterOptions, delegate: *mut TfLiteDelegate);

    fn TfLiteInterpreterCreate(model: *const TfLiteModel, options: *const TfLiteInterpreterOptions) -> *mut TfLiteInterpreter;
    fn TfLiteInterpreterDelete(interpreter: *mut TfLiteInterpreter);

    fn TfLiteInterpreterAllocateTensors(interpreter: *mut TfLiteInterpreter) -> c_int;
    fn TfLiteInterpreterInvoke(interpreter: *mut TfLiteInterpreter) -> c_int;

    fn TfLiteInterpreterGetOutputTensorCount(interpreter: *const TfLiteInterpreter) -> c_int;
    fn TfLiteInterpreterGetInputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *mut TfLiteTensor;
    fn TfLiteInterpreterGetOutputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *const TfLiteTensor;

    fn TfLiteTensorData(tensor: *const TfLiteTensor) -> *mut c_void;
    fn TfLiteTensorByteSize(tensor: *const TfLiteTensor) -> usize;

    fn TfLiteTensorNumDims(tensor: *const TfLiteTensor) -> c_int;
    fn TfLiteTensorDim(tensor: *const TfLiteTensor, dim_index: c_int) -> c_int;
}

#[cfg(feature = "vision-coral")]
#[link(name = "edgetpu")]
extern "C" {
    fn edgetpu_create_delegate(device_type: c_int, device_path: *const c_char, options: *const c_char) -> *mut TfLiteDelegate;
    fn edgetpu_free_delegate(delegate: *mut TfLiteDelegate);
}

/// SSD detector with the `TFLite_Detection_PostProcess` head
/// (boxes, classes, scores, count), optionally on the EdgeTPU.
pub struct TfliteDetector {
    model: *mut TfLiteModel,
    opts: *mut TfLiteInterpreterOptions,
    interp: *mut TfLiteInterpreter,
    #[cfg(feature = "vision-coral")]
    delegate: Option<*mut TfLiteDelegate>,
    input_w: u32,
    input_h: u32,
    // letterboxed model input, reused every frame
    canvas: Vec<u8>,
}

// The interpreter is only ever touched from the loop thread that owns it.
unsafe impl Send for TfliteDetector {}

impl TfliteDetector {
    pub fn new(cfg: &VisionConfig) -> Result<Self> {
        let model_path = cfg.active_model_path();
        anyhow::ensure!(!model_path.is_empty(), "no model path configured (vision.model_path or --model)");
        anyhow::ensure!(std::path::Path::new(model_path).is_file(), "model file not found: {}", model_path);

        let cpath = CString::new(model_path)?;
        let model = unsafe { TfLiteModelCreateFromFile(cpath.as_ptr()) };
        anyhow::ensure!(!model.is_null(), "failed to load tflite model: {}", model_path);

        let opts = unsafe { TfLiteInterpreterOptionsCreate() };
        if opts.is_null() {
            unsafe { TfLiteModelDelete(model) };
            anyhow::bail!("failed to create tflite options");
        }
        unsafe { TfLiteInterpreterOptionsSetNumThreads(opts, cfg.num_threads.max(1)); }

        // From here on Drop releases whatever has been created.
        let mut det = Self {
            model,
            opts,
            interp: ptr::null_mut(),
            #[cfg(feature = "vision-coral")]
            delegate: None,
            input_w: 0,
            input_h: 0,
            canvas: Vec::new(),
        };

        #[cfg(feature = "vision-coral")]
        if cfg.use_coral {
            let d = unsafe { edgetpu_create_delegate(0, ptr::null(), ptr::null()) };
            anyhow::ensure!(!d.is_null(), "failed to create EdgeTPU delegate (accelerator unavailable?)");
            unsafe { TfLiteInterpreterOptionsAddDelegate(det.opts, d); }
            det.delegate = Some(d);
        }

        #[cfg(not(feature = "vision-coral"))]
        if cfg.use_coral {
            anyhow::bail!("vision.use_coral=true but binary not built with --features vision-coral");
        }

        det.interp = unsafe { TfLiteInterpreterCreate(det.model, det.opts) };
        anyhow::ensure!(!det.interp.is_null(), "failed to create tflite interpreter");

        let rc = unsafe { TfLiteInterpreterAllocateTensors(det.interp) };
        anyhow::ensure!(rc == 0, "TfLiteInterpreterAllocateTensors failed");

        let input = unsafe { TfLiteInterpreterGetInputTensor(det.interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");
        let (input_w, input_h) = match tensor_dims(input).as_slice() {
            [1, h, w, 3] => (*w as u32, *h as u32),
            other => anyhow::bail!("expected u8 input [1,h,w,3], got dims {:?}", other),
        };
        let in_bytes = unsafe { TfLiteTensorByteSize(input) };
        let need = (input_w * input_h * 3) as usize;
        anyhow::ensure!(in_bytes == need, "input tensor is {} bytes, expected {} (quantized u8 model?)", in_bytes, need);

        let outputs = unsafe { TfLiteInterpreterGetOutputTensorCount(det.interp) };
        anyhow::ensure!(outputs >= 4, "expected SSD postprocess outputs (4), model has {}", outputs);

        det.input_w = input_w;
        det.input_h = input_h;
        det.canvas = vec![0u8; need];

        info!("vision: loaded TFLite model: {} (input {}x{})", model_path, input_w, input_h);
        Ok(det)
    }

    pub fn inspect(&mut self) -> Result<String> {
        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");
        let in_dims = tensor_dims(input);
        let in_bytes = unsafe { TfLiteTensorByteSize(input) };

        let mut s = format!("TFLite inspect:\n- input[0] dims={:?} bytes={}\n", in_dims, in_bytes);
        let count = unsafe { TfLiteInterpreterGetOutputTensorCount(self.interp) };
        for i in 0..count {
            let out = unsafe { TfLiteInterpreterGetOutputTensor(self.interp, i) };
            if out.is_null() {
                continue;
            }
            let dims = tensor_dims(out);
            let bytes = unsafe { TfLiteTensorByteSize(out) };
            s.push_str(&format!("- output[{}] dims={:?} bytes={}\n", i, dims, bytes));
        }
        Ok(s)
    }

    fn fill_input(&mut self, frame: &Frame) -> Result<Letterbox> {
        let lb = Letterbox::fit(frame.width(), frame.height(), self.input_w, self.input_h);
        let resized = image::imageops::resize(frame.image(), lb.content_w, lb.content_h, FilterType::Triangle);

        self.canvas.fill(0);
        let dst_stride = (self.input_w * 3) as usize;
        let src_stride = (lb.content_w * 3) as usize;
        for (row, src) in resized.as_raw().chunks_exact(src_stride).enumerate() {
            let start = row * dst_stride;
            self.canvas[start..start + src_stride].copy_from_slice(src);
        }

        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");
        let in_ptr = unsafe { TfLiteTensorData(input) as *mut u8 };
        anyhow::ensure!(!in_ptr.is_null(), "null input tensor data");
        unsafe { ptr::copy_nonoverlapping(self.canvas.as_ptr(), in_ptr, self.canvas.len()); }
        Ok(lb)
    }

    fn output_f32(&mut self, index: c_int) -> Result<&[f32]> {
        let out = unsafe { TfLiteInterpreterGetOutputTensor(self.interp, index) };
        anyhow::ensure!(!out.is_null(), "no output tensor {}", index);
        let data = unsafe { TfLiteTensorData(out) as *const f32 };
        anyhow::ensure!(!data.is_null(), "null output tensor {} data", index);
        let len = unsafe { TfLiteTensorByteSize(out) } / std::mem::size_of::<f32>();
        Ok(unsafe { std::slice::from_raw_parts(data, len) })
    }
}

impl Detector for TfliteDetector {
    fn name(&self) -> &'static str {
        #[cfg(feature = "vision-coral")]
        if self.delegate.is_some() {
            return "tflite-edgetpu";
        }
        "tflite"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let lb = self.fill_input(frame)?;

        let rc = unsafe { TfLiteInterpreterInvoke(self.interp) };
        anyhow::ensure!(rc == 0, "TfLiteInterpreterInvoke failed");

        let count = self.output_f32(3)?.first().copied().context("empty count tensor")?;
        let boxes = self.output_f32(0)?.to_vec();
        let classes = self.output_f32(1)?.to_vec();
        let scores = self.output_f32(2)?;

        let n = (count.max(0.0) as usize).min(scores.len()).min(classes.len()).min(boxes.len() / 4);
        debug!("tflite: {} raw candidates", n);
        Ok(postprocess_ssd(&boxes, &classes, &scores[..n], &lb))
    }
}

fn tensor_dims(t: *const TfLiteTensor) -> Vec<i32> {
    unsafe {
        let nd = TfLiteTensorNumDims(t);
        let mut v = Vec::with_capacity(nd as usize);
        for i in 0..nd { v.push(TfLiteTensorDim(t, i)); }
        v
    }
}

impl Drop for TfliteDetector {
    fn drop(&mut self) {
        unsafe {
            if !self.interp.is_null() { TfLiteInterpreterDelete(self.interp); }
            if !self.opts.is_null() { TfLiteInterpreterOptionsDelete(self.opts); }
            if !self.model.is_null() { TfLiteModelDelete(self.model); }
        }
        #[cfg(feature = "vision-coral")]
        unsafe {
            if let Some(d) = self.delegate {
                edgetpu_free_delegate(d);
            }
        }
    }
}
