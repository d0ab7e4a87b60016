use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use burnish_contracts::attempts::{Attempt, AttemptHistory};
use burnish_contracts::errors::RunError;
use burnish_contracts::events::{now_utc_iso, EventWriter};
use burnish_contracts::models::{GeneratorFamily, GeneratorSpec, RefinerSelection};
use burnish_contracts::summary::{write_summary, RunSummary};
use burnish_contracts::templates;
use image::{Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

const WORKFLOW_FLUX_JSON: &str = include_str!("../resources/workflow_flux.json");
const WORKFLOW_FLUX_KREA_JSON: &str = include_str!("../resources/workflow_flux_krea.json");
const WORKFLOW_Z_IMAGE_TURBO_JSON: &str = include_str!("../resources/workflow_z_image_turbo.json");

const HTTP_TIMEOUT_SECONDS: f64 = 60.0;
const CHAT_TIMEOUT_SECONDS: f64 = 600.0;
const WEIGHT_PULL_TIMEOUT_SECONDS: f64 = 3600.0;
const BFL_POLL_INTERVAL_SECONDS: f64 = 0.5;
const BFL_POLL_TIMEOUT_SECONDS: f64 = 300.0;
const WORKFLOW_SCAN_INTERVAL_SECONDS: f64 = 5.0;
const WORKFLOW_WAIT_TIMEOUT_SECONDS: f64 = 1800.0;
const GENERATION_SEED: u64 = 42;
const LOCAL_DEFAULT_TEMPERATURE: f64 = 0.35;
const LOCAL_MAX_OUTPUT_TOKENS: u32 = 1024;
const MAX_REVISION_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub output_dir: PathBuf,
    pub raw: bool,
}

/// One image-generation backend behind a fixed capability surface.
///
/// `generate` blocks until exactly one new image file exists under the
/// request's output directory and returns its path. `free_memory` is a
/// best-effort release of backend-held resources.
pub trait ImageGenerator {
    fn model_name(&self) -> &str;
    fn generate(&self, request: &GenerateRequest) -> Result<PathBuf>;
    fn free_memory(&self) -> Result<()>;
}

/// Builds the generator for a resolved registry entry.
///
/// Workflow-family models dispatch to a local executor and need the
/// directory it writes finished images into.
pub fn build_generator(
    spec: &GeneratorSpec,
    comfyui_output_dir: Option<&Path>,
) -> Result<Box<dyn ImageGenerator>> {
    match spec.family {
        GeneratorFamily::ComfyUi => {
            let watch_dir = comfyui_output_dir.ok_or_else(|| {
                RunError::Configuration(format!(
                    "--comfyui-output-dir is required for model '{}'",
                    spec.name
                ))
            })?;
            Ok(Box::new(ComfyUiGenerator::new(spec, watch_dir.to_path_buf())?))
        }
        GeneratorFamily::Bfl => Ok(Box::new(BflGenerator::new(spec))),
        GeneratorFamily::Dryrun => Ok(Box::new(DryrunGenerator::new(spec))),
    }
}

struct DryrunGenerator {
    model: String,
    width: u32,
    height: u32,
}

impl DryrunGenerator {
    fn new(spec: &GeneratorSpec) -> Self {
        Self {
            model: spec.name.clone(),
            width: spec.width,
            height: spec.height,
        }
    }
}

impl ImageGenerator for DryrunGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn generate(&self, request: &GenerateRequest) -> Result<PathBuf> {
        let output_path = request.output_dir.join(artifact_file_name(&self.model));
        write_dryrun_image(&output_path, self.width, self.height, &request.prompt)?;
        Ok(output_path)
    }

    fn free_memory(&self) -> Result<()> {
        Ok(())
    }
}

struct BflGenerator {
    model: String,
    width: u32,
    height: u32,
    flux2_api: bool,
    api_base: String,
    http: HttpClient,
}

impl BflGenerator {
    fn new(spec: &GeneratorSpec) -> Self {
        Self {
            model: spec.name.clone(),
            width: spec.width,
            height: spec.height,
            flux2_api: spec.name.starts_with("flux-2"),
            api_base: api_base_from_env("BFL_API_BASE", "https://api.bfl.ai"),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Result<String> {
        non_empty_env("BFL_API_KEY").ok_or_else(|| {
            RunError::Configuration("BFL_API_KEY environment variable is not set".to_string())
                .into()
        })
    }

    fn payload(&self, prompt: &str, raw: bool) -> Map<String, Value> {
        let mut payload = map_object(json!({
            "prompt": prompt,
            "width": self.width,
            "height": self.height,
            "seed": GENERATION_SEED,
            "output_format": "png",
        }));
        if self.flux2_api {
            // Flux 2.x tolerance range is 0-5.
            payload.insert("safety_tolerance".to_string(), Value::Number(5.into()));
        } else {
            // Flux 1.x tolerance range is 0-6; raw mode only exists here.
            payload.insert("prompt_upsampling".to_string(), Value::Bool(false));
            payload.insert("safety_tolerance".to_string(), Value::Number(6.into()));
            if raw {
                payload.insert("raw".to_string(), Value::Bool(true));
            }
        }
        payload
    }

    fn post_json(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Map<String, Value>,
    ) -> Result<Value> {
        let response = self
            .http
            .post(endpoint)
            .header("accept", "application/json")
            .header("x-key", api_key)
            .json(&Value::Object(payload.clone()))
            .timeout(Duration::from_secs_f64(HTTP_TIMEOUT_SECONDS))
            .send()
            .with_context(|| format!("generation request failed ({endpoint})"))
            .map_err(generation_failure)?;
        response_json_or_error("generation", response).map_err(generation_failure)
    }

    fn get_json(&self, url: &str, api_key: &str) -> Result<Value> {
        let response = self
            .http
            .get(url)
            .header("accept", "application/json")
            .header("x-key", api_key)
            .timeout(Duration::from_secs_f64(HTTP_TIMEOUT_SECONDS))
            .send()
            .with_context(|| format!("generation poll failed ({url})"))
            .map_err(generation_failure)?;
        response_json_or_error("generation poll", response).map_err(generation_failure)
    }

    fn download_image(&self, url: &str, api_key: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .header("x-key", api_key)
            .timeout(Duration::from_secs_f64(HTTP_TIMEOUT_SECONDS))
            .send()
            .with_context(|| format!("image download failed ({url})"))
            .map_err(generation_failure)?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(RunError::GenerationFailed(format!(
                "image download failed ({code}): {}",
                truncate_text(&body, 512)
            ))
            .into());
        }
        let bytes = response
            .bytes()
            .context("image bytes read failed")
            .map_err(generation_failure)?
            .to_vec();
        Ok(bytes)
    }

    fn poll_until_ready(&self, polling_url: &str, api_key: &str) -> Result<String> {
        let started = Instant::now();
        loop {
            let poll_payload = self.get_json(polling_url, api_key)?;
            let status = poll_payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if status == "Ready" {
                let maybe_url = poll_payload
                    .get("result")
                    .and_then(Value::as_object)
                    .and_then(|result| result.get("sample"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string);
                let Some(url) = maybe_url else {
                    return Err(RunError::GenerationFailed(
                        "ready response missing result.sample URL".to_string(),
                    )
                    .into());
                };
                return Ok(url);
            }
            if matches!(
                status.as_str(),
                "Error" | "Failed" | "Request Moderated" | "Content Moderated"
            ) {
                let detail = poll_payload
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or(status);
                return Err(RunError::GenerationFailed(detail).into());
            }
            if started.elapsed().as_secs_f64() >= BFL_POLL_TIMEOUT_SECONDS {
                return Err(RunError::GenerationFailed(format!(
                    "polling timed out after {BFL_POLL_TIMEOUT_SECONDS:.0}s"
                ))
                .into());
            }
            thread::sleep(Duration::from_secs_f64(BFL_POLL_INTERVAL_SECONDS));
        }
    }
}

impl ImageGenerator for BflGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn generate(&self, request: &GenerateRequest) -> Result<PathBuf> {
        let api_key = Self::api_key()?;
        let endpoint = format!("{}/v1/{}", self.api_base, self.model);
        let payload = self.payload(&request.prompt, request.raw);

        let submitted = self.post_json(&endpoint, &api_key, &payload)?;
        let polling_url = submitted
            .get("polling_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| {
                submitted
                    .get("id")
                    .and_then(Value::as_str)
                    .map(|id| format!("{}/v1/get_result?id={id}", self.api_base))
            })
            .ok_or_else(|| {
                RunError::GenerationFailed(
                    "submit response carries neither polling_url nor id".to_string(),
                )
            })?;

        let image_url = self.poll_until_ready(&polling_url, &api_key)?;
        let image_bytes = self.download_image(&image_url, &api_key)?;

        let output_path = request.output_dir.join(artifact_file_name(&self.model));
        let raw_label = if request.raw { "true" } else { "false" };
        let metadata = [
            ("prompt", request.prompt.as_str()),
            ("model", self.model.as_str()),
            ("raw", raw_label),
        ];
        write_png_with_text(&output_path, &image_bytes, &metadata)?;
        Ok(output_path)
    }

    fn free_memory(&self) -> Result<()> {
        Ok(())
    }
}

struct ComfyUiGenerator {
    model: String,
    workflow: Value,
    prompt_node_id: String,
    api_base: String,
    watch_dir: PathBuf,
    http: HttpClient,
}

impl ComfyUiGenerator {
    fn new(spec: &GeneratorSpec, watch_dir: PathBuf) -> Result<Self> {
        let (workflow, prompt_node_id) = workflow_for_model(&spec.name)?;
        Ok(Self {
            model: spec.name.clone(),
            workflow,
            prompt_node_id: prompt_node_id.to_string(),
            api_base: api_base_from_env("COMFYUI_URL", "http://127.0.0.1:8000"),
            watch_dir,
            http: HttpClient::new(),
        })
    }

    fn queue_prompt(&self, prompt: &str) -> Result<()> {
        let workflow = patch_workflow_prompt(&self.workflow, &self.prompt_node_id, prompt)?;
        let endpoint = format!("{}/prompt", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .json(&json!({ "prompt": workflow }))
            .timeout(Duration::from_secs_f64(HTTP_TIMEOUT_SECONDS))
            .send()
            .with_context(|| format!("workflow dispatch failed ({endpoint})"))
            .map_err(generation_failure)?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(RunError::GenerationFailed(format!(
                "workflow dispatch failed ({code}): {}",
                truncate_text(&body, 512)
            ))
            .into());
        }
        Ok(())
    }

    fn wait_for_new_image(&self, known: &BTreeSet<PathBuf>) -> Result<PathBuf> {
        let started = Instant::now();
        loop {
            if let Some(newest) = newest_new_png(&self.watch_dir, known)? {
                return Ok(newest);
            }
            if started.elapsed().as_secs_f64() >= WORKFLOW_WAIT_TIMEOUT_SECONDS {
                return Err(RunError::GenerationFailed(format!(
                    "no new image appeared in {} after {WORKFLOW_WAIT_TIMEOUT_SECONDS:.0}s",
                    self.watch_dir.display()
                ))
                .into());
            }
            thread::sleep(Duration::from_secs_f64(WORKFLOW_SCAN_INTERVAL_SECONDS));
        }
    }
}

impl ImageGenerator for ComfyUiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn generate(&self, request: &GenerateRequest) -> Result<PathBuf> {
        let known = png_snapshot(&self.watch_dir)?;
        self.queue_prompt(&request.prompt)?;
        let produced = self.wait_for_new_image(&known)?;
        let output_path = request.output_dir.join(artifact_file_name(&self.model));
        move_file(&produced, &output_path)?;
        Ok(output_path)
    }

    fn free_memory(&self) -> Result<()> {
        let endpoint = format!("{}/free", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .json(&json!({ "unload_models": true, "free_memory": true }))
            .timeout(Duration::from_secs_f64(HTTP_TIMEOUT_SECONDS))
            .send()
            .with_context(|| format!("memory release failed ({endpoint})"))?;
        if !response.status().is_success() {
            bail!("memory release failed ({})", response.status().as_u16());
        }
        Ok(())
    }
}

fn workflow_for_model(model: &str) -> Result<(Value, &'static str)> {
    let (raw, prompt_node_id) = match model {
        "comfyui-flux" => (WORKFLOW_FLUX_JSON, "6"),
        "comfyui-flux-krea" => (WORKFLOW_FLUX_KREA_JSON, "6"),
        "comfyui-z-image-turbo" => (WORKFLOW_Z_IMAGE_TURBO_JSON, "45"),
        other => bail!("no embedded workflow for model '{other}'"),
    };
    let workflow: Value = serde_json::from_str(raw)
        .with_context(|| format!("embedded workflow for '{model}' is invalid JSON"))?;
    Ok((workflow, prompt_node_id))
}

fn patch_workflow_prompt(workflow: &Value, prompt_node_id: &str, prompt: &str) -> Result<Value> {
    let mut patched = workflow.clone();
    let node_text = patched
        .get_mut(prompt_node_id)
        .and_then(|node| node.get_mut("inputs"))
        .and_then(|inputs| inputs.get_mut("text"))
        .ok_or_else(|| {
            anyhow::anyhow!("workflow node '{prompt_node_id}' has no inputs.text to patch")
        })?;
    *node_text = Value::String(prompt.to_string());
    Ok(patched)
}

/// One review-and-revise conversation against a loaded refine model.
///
/// Sessions come from [`RefineBackend::open`] and are used by exactly one
/// iteration at a time. `close` releases whatever the session holds; for
/// local models that includes accelerator memory, and a closed session
/// cannot be reused.
pub trait RefineSession {
    fn review(
        &mut self,
        prompt: &str,
        image_path: &Path,
        temperature: Option<f64>,
    ) -> Result<String>;
    fn revise(&mut self, prompt: &str, temperature: Option<f64>) -> Result<String>;
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait RefineBackend {
    fn name(&self) -> &str;
    fn open(&self) -> Result<Box<dyn RefineSession>>;
}

pub fn build_refiner(selection: &RefinerSelection) -> Box<dyn RefineBackend> {
    match selection {
        RefinerSelection::Local { name, model_tag } => Box::new(OllamaVisionModel::new(
            name.clone(),
            model_tag.clone(),
        )),
        RefinerSelection::Hosted { model } => Box::new(HostedChatModel::new(model.clone())),
    }
}

struct OllamaVisionModel {
    name: String,
    model_tag: String,
    api_base: String,
    http: HttpClient,
}

impl OllamaVisionModel {
    fn new(name: String, model_tag: String) -> Self {
        Self {
            name,
            model_tag,
            api_base: api_base_from_env("OLLAMA_HOST", "http://127.0.0.1:11434"),
            http: HttpClient::new(),
        }
    }

    fn probe(&self) -> Result<()> {
        let endpoint = format!("{}/api/tags", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .timeout(Duration::from_secs_f64(HTTP_TIMEOUT_SECONDS))
            .send()
            .with_context(|| {
                format!(
                    "no model server reachable at {}; start one with `ollama serve`",
                    self.api_base
                )
            })?;
        if !response.status().is_success() {
            bail!(
                "model server probe failed ({})",
                response.status().as_u16()
            );
        }
        Ok(())
    }

    fn pull_weights(&self) -> Result<()> {
        // No-op when the weights are already in the local store.
        let endpoint = format!("{}/api/pull", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .json(&json!({ "model": self.model_tag, "stream": false }))
            .timeout(Duration::from_secs_f64(WEIGHT_PULL_TIMEOUT_SECONDS))
            .send()
            .with_context(|| format!("weight pull failed for {}", self.model_tag))?;
        let payload = response_json_or_error("weight pull", response)?;
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if status != "success" {
            bail!(
                "weight pull for {} ended with status '{status}'",
                self.model_tag
            );
        }
        Ok(())
    }

    fn warm_up(&self) -> Result<()> {
        // An empty message list loads the model and keeps it resident.
        let endpoint = format!("{}/api/chat", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .json(&json!({ "model": self.model_tag, "messages": [], "keep_alive": -1 }))
            .timeout(Duration::from_secs_f64(CHAT_TIMEOUT_SECONDS))
            .send()
            .with_context(|| format!("model load failed for {}", self.model_tag))?;
        response_json_or_error("model load", response)?;
        Ok(())
    }
}

impl RefineBackend for OllamaVisionModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<Box<dyn RefineSession>> {
        self.probe()?;
        self.pull_weights()?;
        self.warm_up()?;
        Ok(Box::new(LocalVisionSession {
            model_tag: self.model_tag.clone(),
            api_base: self.api_base.clone(),
            http: self.http.clone(),
            loaded: true,
        }))
    }
}

struct LocalVisionSession {
    model_tag: String,
    api_base: String,
    http: HttpClient,
    loaded: bool,
}

impl LocalVisionSession {
    fn ensure_loaded(&self) -> Result<()> {
        if !self.loaded {
            return Err(RunError::NotLoaded(self.model_tag.clone()).into());
        }
        Ok(())
    }

    fn chat(
        &self,
        content: &str,
        images: Option<Vec<String>>,
        temperature: Option<f64>,
    ) -> Result<String> {
        let mut message = map_object(json!({ "role": "user", "content": content }));
        if let Some(images) = images {
            message.insert(
                "images".to_string(),
                Value::Array(images.into_iter().map(Value::String).collect()),
            );
        }
        let body = json!({
            "model": self.model_tag,
            "messages": [Value::Object(message)],
            "stream": false,
            "options": {
                "temperature": temperature.unwrap_or(LOCAL_DEFAULT_TEMPERATURE),
                "num_predict": LOCAL_MAX_OUTPUT_TOKENS,
            },
        });
        let endpoint = format!("{}/api/chat", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .json(&body)
            .timeout(Duration::from_secs_f64(CHAT_TIMEOUT_SECONDS))
            .send()
            .with_context(|| format!("chat request failed ({endpoint})"))?;
        let payload = response_json_or_error("chat", response)?;
        payload
            .get("message")
            .and_then(Value::as_object)
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("chat response missing message.content"))
    }
}

impl RefineSession for LocalVisionSession {
    fn review(
        &mut self,
        prompt: &str,
        image_path: &Path,
        temperature: Option<f64>,
    ) -> Result<String> {
        self.ensure_loaded()?;
        let bytes = fs::read(image_path)
            .with_context(|| format!("failed reading {}", image_path.display()))?;
        self.chat(prompt, Some(vec![BASE64.encode(bytes)]), temperature)
    }

    fn revise(&mut self, prompt: &str, temperature: Option<f64>) -> Result<String> {
        self.ensure_loaded()?;
        self.chat(prompt, None, temperature)
    }

    fn close(&mut self) -> Result<()> {
        if !self.loaded {
            return Ok(());
        }
        // Mark unloaded first: even a failed release leaves the session spent.
        self.loaded = false;
        let endpoint = format!("{}/api/chat", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .json(&json!({ "model": self.model_tag, "messages": [], "keep_alive": 0 }))
            .timeout(Duration::from_secs_f64(HTTP_TIMEOUT_SECONDS))
            .send()
            .with_context(|| format!("model unload failed for {}", self.model_tag))?;
        response_json_or_error("model unload", response)?;
        Ok(())
    }
}

impl Drop for LocalVisionSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct HostedChatModel {
    model: String,
    api_base: String,
    http: HttpClient,
}

impl HostedChatModel {
    fn new(model: String) -> Self {
        Self {
            model,
            api_base: api_base_from_env("OPENAI_API_BASE", "https://api.openai.com/v1"),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Result<String> {
        non_empty_env("OPENAI_API_KEY").ok_or_else(|| {
            RunError::Configuration("OPENAI_API_KEY environment variable is not set".to_string())
                .into()
        })
    }
}

impl RefineBackend for HostedChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    fn open(&self) -> Result<Box<dyn RefineSession>> {
        Ok(Box::new(HostedChatSession {
            model: self.model.clone(),
            api_base: self.api_base.clone(),
            http: self.http.clone(),
        }))
    }
}

struct HostedChatSession {
    model: String,
    api_base: String,
    http: HttpClient,
}

impl HostedChatSession {
    fn chat(&self, content: Value, temperature: Option<f64>) -> Result<String> {
        let api_key = HostedChatModel::api_key()?;
        let mut body = map_object(json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
        }));
        if let Some(temperature) = temperature {
            if let Some(number) = serde_json::Number::from_f64(temperature) {
                body.insert("temperature".to_string(), Value::Number(number));
            }
        }
        let endpoint = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .header(AUTHORIZATION, format!("Bearer {api_key}"))
            .json(&Value::Object(body))
            .timeout(Duration::from_secs_f64(CHAT_TIMEOUT_SECONDS))
            .send()
            .with_context(|| format!("chat request failed ({endpoint})"))?;
        let payload = response_json_or_error("chat", response)?;
        payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("chat response missing choices[0].message.content"))
    }
}

impl RefineSession for HostedChatSession {
    fn review(
        &mut self,
        prompt: &str,
        image_path: &Path,
        temperature: Option<f64>,
    ) -> Result<String> {
        let data_uri = image_data_uri(image_path)?;
        let content = json!([
            { "type": "text", "text": prompt },
            { "type": "image_url", "image_url": { "url": data_uri } },
        ]);
        self.chat(content, temperature)
    }

    fn revise(&mut self, prompt: &str, temperature: Option<f64>) -> Result<String> {
        self.chat(Value::String(prompt.to_string()), temperature)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub iterations: u32,
    pub raw: bool,
    pub free_vram: bool,
    pub review_temperature: Option<f64>,
    pub refine_temperature: Option<f64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            iterations: 3,
            raw: false,
            free_vram: false,
            review_temperature: None,
            refine_temperature: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: u32,
    pub iterations: u32,
    pub prompt: String,
    pub image_path: PathBuf,
    pub review: String,
    pub revised_prompt: String,
    pub duplicate_retries: u32,
}

/// Drives one refinement run: generate, review, revise, advance.
///
/// The loop owns the run's only mutable state (current prompt plus attempt
/// history) and appends to the event log as it goes. A run that errors
/// mid-iteration keeps the history recorded so far but produces no final
/// prompt.
pub struct RefineLoop {
    run_id: String,
    output_dir: PathBuf,
    summary_path: PathBuf,
    events: EventWriter,
    generator: Box<dyn ImageGenerator>,
    refiner: Box<dyn RefineBackend>,
    options: RunOptions,
    original_prompt: String,
    current_prompt: String,
    history: AttemptHistory,
    images: Vec<PathBuf>,
    completed: u32,
    started_at: String,
}

impl RefineLoop {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        original_prompt: impl Into<String>,
        generator: Box<dyn ImageGenerator>,
        refiner: Box<dyn RefineBackend>,
        options: RunOptions,
    ) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        let run_id = output_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("run")
            .to_string();
        let events = EventWriter::new(events_path.into(), run_id.clone());
        let summary_path = output_dir.join("summary.json");
        let started_at = now_utc_iso();
        let original_prompt = original_prompt.into();

        events.emit(
            "run_started",
            map_object(json!({
                "out_dir": output_dir.to_string_lossy().to_string(),
                "gen_model": generator.model_name(),
                "refine_model": refiner.name(),
                "iterations": options.iterations,
                "prompt": original_prompt,
            })),
        )?;

        Ok(Self {
            run_id,
            output_dir,
            summary_path,
            events,
            generator,
            refiner,
            options,
            current_prompt: original_prompt.clone(),
            original_prompt,
            history: AttemptHistory::new(),
            images: Vec::new(),
            completed: 0,
            started_at,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn current_prompt(&self) -> &str {
        &self.current_prompt
    }

    pub fn history(&self) -> &AttemptHistory {
        &self.history
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn is_done(&self) -> bool {
        self.completed >= self.options.iterations
    }

    /// Runs one full iteration and advances the current prompt.
    pub fn step(&mut self) -> Result<IterationReport> {
        if self.is_done() {
            bail!(
                "refinement already completed {} iterations",
                self.options.iterations
            );
        }
        let iteration = self.completed + 1;
        self.events.emit(
            "iteration_started",
            map_object(json!({
                "iteration": iteration,
                "iterations": self.options.iterations,
                "prompt": self.current_prompt,
            })),
        )?;

        let request = GenerateRequest {
            prompt: self.current_prompt.clone(),
            output_dir: self.output_dir.clone(),
            raw: self.options.raw,
        };
        let image_path = self.generator.generate(&request)?;
        self.images.push(image_path.clone());
        self.events.emit(
            "image_generated",
            map_object(json!({
                "iteration": iteration,
                "image_path": image_path.to_string_lossy().to_string(),
            })),
        )?;

        if self.options.free_vram {
            self.generator.free_memory()?;
            self.events.emit(
                "memory_freed",
                map_object(json!({
                    "iteration": iteration,
                    "model": self.generator.model_name(),
                })),
            )?;
        }

        let mut session = self.refiner.open()?;
        let outcome = self.review_and_revise(session.as_mut(), iteration, &image_path);
        let close_result = session.close();
        drop(session);
        let (review, revised_prompt, duplicate_retries) = outcome?;
        if let Err(err) = close_result {
            self.events.emit(
                "refine_unload_failed",
                map_object(json!({
                    "iteration": iteration,
                    "error": format!("{err:#}"),
                })),
            )?;
        }

        let report = IterationReport {
            iteration,
            iterations: self.options.iterations,
            prompt: self.current_prompt.clone(),
            image_path,
            review,
            revised_prompt,
            duplicate_retries,
        };
        self.current_prompt = report.revised_prompt.clone();
        self.completed += 1;
        self.events.emit(
            "prompt_revised",
            map_object(json!({
                "iteration": iteration,
                "prompt": report.revised_prompt,
                "duplicate_retries": report.duplicate_retries,
            })),
        )?;
        Ok(report)
    }

    fn review_and_revise(
        &mut self,
        session: &mut dyn RefineSession,
        iteration: u32,
        image_path: &Path,
    ) -> Result<(String, String, u32)> {
        let review_request = templates::review_prompt(&self.original_prompt);
        let review = session.review(&review_request, image_path, self.options.review_temperature)?;
        self.events.emit(
            "review_completed",
            map_object(json!({
                "iteration": iteration,
                "review": review,
            })),
        )?;

        // The revision transcript appends the current pair itself, so it is
        // built from the history as it stood before this attempt lands.
        let revision_request = templates::revision_prompt(
            &self.original_prompt,
            &self.current_prompt,
            &review,
            self.history.attempts(),
        );
        self.history
            .push(Attempt::new(self.current_prompt.clone(), review.clone()));

        let mut revised = String::new();
        let mut duplicate_retries = 0u32;
        for attempt in 1..=MAX_REVISION_ATTEMPTS {
            revised = session.revise(&revision_request, self.options.refine_temperature)?;
            if !self.history.contains_prompt(&revised) {
                break;
            }
            // The last duplicate is accepted once the retry budget runs out.
            duplicate_retries += 1;
            self.events.emit(
                "duplicate_prompt",
                map_object(json!({
                    "iteration": iteration,
                    "attempt": attempt,
                    "prompt": revised,
                })),
            )?;
        }
        Ok((review, revised, duplicate_retries))
    }

    /// Steps through every remaining iteration.
    pub fn run(&mut self) -> Result<()> {
        while !self.is_done() {
            self.step()?;
        }
        Ok(())
    }

    /// Writes `summary.json` and emits the closing event.
    pub fn finish(&mut self) -> Result<RunSummary> {
        let summary = RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            gen_model: self.generator.model_name().to_string(),
            refine_model: self.refiner.name().to_string(),
            original_prompt: self.original_prompt.clone(),
            final_prompt: self.current_prompt.clone(),
            iterations_completed: self.completed,
            attempts: self.history.attempts().to_vec(),
            images: self
                .images
                .iter()
                .map(|path| path.to_string_lossy().to_string())
                .collect(),
            ts: String::new(),
        }
        .stamped();
        write_summary(&self.summary_path, &summary)?;
        self.events.emit(
            "run_finished",
            map_object(json!({
                "summary_path": self.summary_path.to_string_lossy().to_string(),
                "final_prompt": summary.final_prompt,
                "iterations_completed": summary.iterations_completed,
            })),
        )?;
        Ok(summary)
    }
}

fn map_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn api_base_from_env(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Transport and HTTP-status faults on a generation path count as
/// [`RunError::GenerationFailed`]; the context chain becomes the payload.
fn generation_failure(err: anyhow::Error) -> anyhow::Error {
    RunError::GenerationFailed(format!("{err:#}")).into()
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{label} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{label} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn artifact_file_name(model: &str) -> String {
    format!("{model}_{}.png", timestamp_millis())
}

fn write_dryrun_image(path: &Path, width: u32, height: u32, prompt: &str) -> Result<()> {
    let (r, g, b) = color_from_prompt(prompt);
    let mut image = RgbImage::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    image
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn write_png_with_text(path: &Path, image_bytes: &[u8], entries: &[(&str, &str)]) -> Result<()> {
    let decoded = image::load_from_memory(image_bytes)
        .context("downloaded image is not a decodable bitmap")?
        .to_rgba8();
    let file =
        fs::File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), decoded.width(), decoded.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    for (key, value) in entries {
        encoder
            .add_text_chunk((*key).to_string(), (*value).to_string())
            .with_context(|| format!("failed to embed metadata key '{key}'"))?;
    }
    let mut writer = encoder.write_header().context("failed to write PNG header")?;
    writer
        .write_image_data(decoded.as_raw())
        .context("failed to write PNG image data")?;
    Ok(())
}

/// Reads the textual key/value metadata embedded in a PNG artifact.
pub fn read_png_text(path: &Path) -> Result<Vec<(String, String)>> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let decoder = png::Decoder::new(file);
    let reader = decoder.read_info().context("failed to read PNG info")?;
    let entries = reader
        .info()
        .uncompressed_latin1_text
        .iter()
        .map(|chunk| (chunk.keyword.clone(), chunk.text.clone()))
        .collect();
    Ok(entries)
}

fn png_snapshot(dir: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut found = BTreeSet::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to scan {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("png") {
            found.insert(path);
        }
    }
    Ok(found)
}

fn newest_new_png(dir: &Path, known: &BTreeSet<PathBuf>) -> Result<Option<PathBuf>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for path in png_snapshot(dir)? {
        if known.contains(&path) {
            continue;
        }
        let meta =
            fs::metadata(&path).with_context(|| format!("failed to stat {}", path.display()))?;
        let created = meta
            .created()
            .or_else(|_| meta.modified())
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let replace = match &newest {
            Some((best, _)) => created > *best,
            None => true,
        };
        if replace {
            newest = Some((created, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // The watched directory may sit on a different filesystem than the run dir.
    fs::copy(from, to)
        .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
    fs::remove_file(from)
        .with_context(|| format!("failed to remove {}", from.display()))?;
    Ok(())
}

fn image_data_uri(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(format!("data:image/png;base64,{}", BASE64.encode(bytes)))
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::rc::Rc;

    use burnish_contracts::models::{resolve_refiner, GeneratorRegistry};

    use super::*;

    struct FixedPathGenerator {
        model: String,
        fail_on_call: Option<u32>,
        calls: Rc<Cell<u32>>,
        free_calls: Rc<Cell<u32>>,
    }

    impl ImageGenerator for FixedPathGenerator {
        fn model_name(&self) -> &str {
            &self.model
        }

        fn generate(&self, request: &GenerateRequest) -> Result<PathBuf> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            if self.fail_on_call == Some(call) {
                return Err(
                    RunError::GenerationFailed("backend rejected the job".to_string()).into(),
                );
            }
            Ok(request.output_dir.join(format!("{}_{call}.png", self.model)))
        }

        fn free_memory(&self) -> Result<()> {
            self.free_calls.set(self.free_calls.get() + 1);
            Ok(())
        }
    }

    #[derive(Clone)]
    struct ScriptedRefiner {
        reviews: Rc<RefCell<VecDeque<String>>>,
        revisions: Rc<RefCell<VecDeque<String>>>,
        review_calls: Rc<Cell<u32>>,
        revise_calls: Rc<Cell<u32>>,
        closes: Rc<Cell<u32>>,
    }

    impl ScriptedRefiner {
        fn new(reviews: &[&str], revisions: &[&str]) -> Self {
            Self {
                reviews: Rc::new(RefCell::new(
                    reviews.iter().map(|text| text.to_string()).collect(),
                )),
                revisions: Rc::new(RefCell::new(
                    revisions.iter().map(|text| text.to_string()).collect(),
                )),
                review_calls: Rc::new(Cell::new(0)),
                revise_calls: Rc::new(Cell::new(0)),
                closes: Rc::new(Cell::new(0)),
            }
        }
    }

    impl RefineBackend for ScriptedRefiner {
        fn name(&self) -> &str {
            "scripted"
        }

        fn open(&self) -> Result<Box<dyn RefineSession>> {
            Ok(Box::new(self.clone()))
        }
    }

    impl RefineSession for ScriptedRefiner {
        fn review(
            &mut self,
            _prompt: &str,
            _image_path: &Path,
            _temperature: Option<f64>,
        ) -> Result<String> {
            self.review_calls.set(self.review_calls.get() + 1);
            Ok(self
                .reviews
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| "fine".to_string()))
        }

        fn revise(&mut self, _prompt: &str, _temperature: Option<f64>) -> Result<String> {
            self.revise_calls.set(self.revise_calls.get() + 1);
            Ok(self
                .revisions
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| "revised".to_string()))
        }

        fn close(&mut self) -> Result<()> {
            self.closes.set(self.closes.get() + 1);
            Ok(())
        }
    }

    fn scripted_loop(
        output_dir: &Path,
        original_prompt: &str,
        refiner: &ScriptedRefiner,
        fail_on_call: Option<u32>,
        options: RunOptions,
    ) -> Result<(RefineLoop, Rc<Cell<u32>>, Rc<Cell<u32>>)> {
        let calls = Rc::new(Cell::new(0));
        let free_calls = Rc::new(Cell::new(0));
        let generator = FixedPathGenerator {
            model: "scripted-gen".to_string(),
            fail_on_call,
            calls: calls.clone(),
            free_calls: free_calls.clone(),
        };
        let refine_loop = RefineLoop::new(
            output_dir,
            output_dir.join("events.jsonl"),
            original_prompt,
            Box::new(generator),
            Box::new(refiner.clone()),
            options,
        )?;
        Ok((refine_loop, calls, free_calls))
    }

    fn event_types(events_path: &Path) -> Vec<String> {
        fs::read_to_string(events_path)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    #[test]
    fn single_iteration_records_attempt_and_advances_prompt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("run");
        let refiner = ScriptedRefiner::new(&["ok, 9/10"], &["a fluffy cat"]);
        let (mut refine_loop, gen_calls, _) = scripted_loop(
            &out,
            "a cat",
            &refiner,
            None,
            RunOptions {
                iterations: 1,
                ..RunOptions::default()
            },
        )?;

        let report = refine_loop.step()?;
        assert_eq!(report.iteration, 1);
        assert_eq!(report.prompt, "a cat");
        assert_eq!(report.review, "ok, 9/10");
        assert_eq!(report.revised_prompt, "a fluffy cat");
        assert_eq!(report.duplicate_retries, 0);

        assert!(refine_loop.is_done());
        assert_eq!(refine_loop.current_prompt(), "a fluffy cat");
        assert_eq!(
            refine_loop.history().attempts(),
            &[Attempt::new("a cat", "ok, 9/10")]
        );
        assert_eq!(gen_calls.get(), 1);
        assert_eq!(refiner.closes.get(), 1);

        let summary = refine_loop.finish()?;
        assert_eq!(summary.final_prompt, "a fluffy cat");
        assert_eq!(summary.iterations_completed, 1);
        assert_eq!(summary.original_prompt, "a cat");
        assert!(out.join("summary.json").exists());

        let types = event_types(&out.join("events.jsonl"));
        for expected in [
            "run_started",
            "iteration_started",
            "image_generated",
            "review_completed",
            "prompt_revised",
            "run_finished",
        ] {
            assert!(types.contains(&expected.to_string()), "missing {expected}");
        }
        let image_idx = types
            .iter()
            .position(|value| value == "image_generated")
            .expect("missing image_generated");
        let review_idx = types
            .iter()
            .position(|value| value == "review_completed")
            .expect("missing review_completed");
        assert!(image_idx < review_idx);
        Ok(())
    }

    #[test]
    fn duplicate_revisions_are_retried_until_fresh() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("run");
        let refiner = ScriptedRefiner::new(&["dim, 4/10"], &["a cat", "a cat", "a brighter cat"]);
        let (mut refine_loop, _, _) = scripted_loop(
            &out,
            "a cat",
            &refiner,
            None,
            RunOptions {
                iterations: 1,
                ..RunOptions::default()
            },
        )?;

        let report = refine_loop.step()?;
        assert_eq!(report.revised_prompt, "a brighter cat");
        assert_eq!(report.duplicate_retries, 2);
        assert_eq!(refiner.revise_calls.get(), 3);

        let duplicates = event_types(&out.join("events.jsonl"))
            .into_iter()
            .filter(|value| value == "duplicate_prompt")
            .count();
        assert_eq!(duplicates, 2);
        Ok(())
    }

    #[test]
    fn exhausted_retry_budget_accepts_the_duplicate() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("run");
        let refiner = ScriptedRefiner::new(&["dim, 4/10"], &["a cat", "a cat", "a cat"]);
        let (mut refine_loop, _, _) = scripted_loop(
            &out,
            "a cat",
            &refiner,
            None,
            RunOptions {
                iterations: 1,
                ..RunOptions::default()
            },
        )?;

        let report = refine_loop.step()?;
        assert_eq!(report.revised_prompt, "a cat");
        assert_eq!(report.duplicate_retries, 3);
        assert_eq!(refiner.revise_calls.get(), 3);
        assert_eq!(refine_loop.current_prompt(), "a cat");
        Ok(())
    }

    #[test]
    fn generation_failure_aborts_run_and_keeps_history() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("run");
        let refiner = ScriptedRefiner::new(&["good, 8/10"], &["a striped cat", "a spotted cat"]);
        let (mut refine_loop, gen_calls, _) = scripted_loop(
            &out,
            "a cat",
            &refiner,
            Some(2),
            RunOptions {
                iterations: 3,
                ..RunOptions::default()
            },
        )?;

        let err = refine_loop.run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::GenerationFailed(_))
        ));
        assert_eq!(refine_loop.history().attempts().len(), 1);
        assert_eq!(refine_loop.completed(), 1);
        assert_eq!(gen_calls.get(), 2);
        assert_eq!(refiner.review_calls.get(), 1);
        assert_eq!(refiner.revise_calls.get(), 1);
        Ok(())
    }

    #[test]
    fn free_vram_option_controls_memory_release() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let refiner = ScriptedRefiner::new(&[], &[]);

        let out = temp.path().join("with");
        let (mut with_flag, _, free_calls) = scripted_loop(
            &out,
            "a cat",
            &refiner,
            None,
            RunOptions {
                iterations: 1,
                free_vram: true,
                ..RunOptions::default()
            },
        )?;
        with_flag.run()?;
        assert_eq!(free_calls.get(), 1);
        assert!(event_types(&out.join("events.jsonl")).contains(&"memory_freed".to_string()));

        let out = temp.path().join("without");
        let (mut without_flag, _, free_calls) = scripted_loop(
            &out,
            "a cat",
            &refiner,
            None,
            RunOptions {
                iterations: 1,
                ..RunOptions::default()
            },
        )?;
        without_flag.run()?;
        assert_eq!(free_calls.get(), 0);
        Ok(())
    }

    #[test]
    fn zero_iteration_run_finishes_with_original_prompt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("run");
        let refiner = ScriptedRefiner::new(&[], &[]);
        let (mut refine_loop, gen_calls, _) = scripted_loop(
            &out,
            "a cat",
            &refiner,
            None,
            RunOptions {
                iterations: 0,
                ..RunOptions::default()
            },
        )?;

        assert!(refine_loop.is_done());
        refine_loop.run()?;
        let summary = refine_loop.finish()?;
        assert_eq!(summary.final_prompt, "a cat");
        assert_eq!(summary.iterations_completed, 0);
        assert_eq!(gen_calls.get(), 0);
        Ok(())
    }

    #[test]
    fn step_after_completion_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("run");
        let refiner = ScriptedRefiner::new(&[], &[]);
        let (mut refine_loop, _, _) = scripted_loop(
            &out,
            "a cat",
            &refiner,
            None,
            RunOptions {
                iterations: 1,
                ..RunOptions::default()
            },
        )?;

        refine_loop.run()?;
        assert!(refine_loop.step().is_err());
        Ok(())
    }

    #[test]
    fn build_generator_requires_watch_dir_for_workflow_models() -> anyhow::Result<()> {
        let registry = GeneratorRegistry::new(None);
        let spec = registry.resolve("comfyui-flux")?.clone();
        let Err(err) = build_generator(&spec, None) else {
            panic!("a workflow model without a watch dir must be rejected");
        };
        match err.downcast_ref::<RunError>() {
            Some(RunError::Configuration(message)) => {
                assert!(message.contains("--comfyui-output-dir"));
            }
            other => panic!("expected Configuration error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn dryrun_generator_writes_an_image_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = GeneratorRegistry::new(None);
        let spec = registry.resolve("dryrun")?.clone();
        let generator = build_generator(&spec, None)?;

        let request = GenerateRequest {
            prompt: "a teal square".to_string(),
            output_dir: temp.path().to_path_buf(),
            raw: false,
        };
        let path = generator.generate(&request)?;
        assert!(path.exists());
        let file_name = path.file_name().and_then(|name| name.to_str()).unwrap_or("");
        assert!(file_name.starts_with("dryrun_"));
        assert!(file_name.ends_with(".png"));

        let decoded = image::open(&path)?.to_rgb8();
        assert_eq!(decoded.width(), spec.width);
        assert_eq!(decoded.height(), spec.height);
        generator.free_memory()?;
        Ok(())
    }

    #[test]
    fn prompt_color_is_deterministic() {
        assert_eq!(color_from_prompt("a cat"), color_from_prompt("a cat"));
        assert_ne!(color_from_prompt("a cat"), color_from_prompt("a dog"));
    }

    #[test]
    fn bfl_payload_shapes_differ_between_api_generations() -> anyhow::Result<()> {
        let registry = GeneratorRegistry::new(None);

        let legacy = BflGenerator::new(registry.resolve("flux-dev")?);
        let payload = legacy.payload("a cat", false);
        assert_eq!(payload["prompt"], json!("a cat"));
        assert_eq!(payload["width"], json!(1216));
        assert_eq!(payload["height"], json!(832));
        assert_eq!(payload["seed"], json!(42));
        assert_eq!(payload["output_format"], json!("png"));
        assert_eq!(payload["prompt_upsampling"], json!(false));
        assert_eq!(payload["safety_tolerance"], json!(6));
        assert!(!payload.contains_key("raw"));

        let payload = legacy.payload("a cat", true);
        assert_eq!(payload["raw"], json!(true));

        let flux2 = BflGenerator::new(registry.resolve("flux-2-max")?);
        let payload = flux2.payload("a cat", true);
        assert_eq!(payload["safety_tolerance"], json!(5));
        assert!(!payload.contains_key("prompt_upsampling"));
        assert!(!payload.contains_key("raw"));
        Ok(())
    }

    #[test]
    fn transport_failures_surface_as_generation_failed() -> anyhow::Result<()> {
        // Nothing listens on the discard port, so both calls fail at connect.
        let generator = BflGenerator {
            model: "flux-dev".to_string(),
            width: 1216,
            height: 832,
            flux2_api: false,
            api_base: "http://127.0.0.1:9".to_string(),
            http: HttpClient::new(),
        };
        let endpoint = format!("{}/v1/{}", generator.api_base, generator.model);
        let payload = generator.payload("a cat", false);
        let Err(err) = generator.post_json(&endpoint, "test-key", &payload) else {
            panic!("a request to a closed port must fail");
        };
        match err.downcast_ref::<RunError>() {
            Some(RunError::GenerationFailed(detail)) => {
                assert!(detail.contains("generation request failed"));
            }
            other => panic!("expected GenerationFailed, got {other:?}"),
        }

        let temp = tempfile::tempdir()?;
        let registry = GeneratorRegistry::new(None);
        let mut workflow_generator =
            ComfyUiGenerator::new(registry.resolve("comfyui-flux")?, temp.path().to_path_buf())?;
        workflow_generator.api_base = "http://127.0.0.1:9".to_string();
        let request = GenerateRequest {
            prompt: "a cat".to_string(),
            output_dir: temp.path().to_path_buf(),
            raw: false,
        };
        let Err(err) = workflow_generator.generate(&request) else {
            panic!("a dispatch to a closed port must fail");
        };
        match err.downcast_ref::<RunError>() {
            Some(RunError::GenerationFailed(detail)) => {
                assert!(detail.contains("workflow dispatch failed"));
            }
            other => panic!("expected GenerationFailed, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn embedded_workflows_parse_and_patch() -> anyhow::Result<()> {
        for (model, node_id) in [
            ("comfyui-flux", "6"),
            ("comfyui-flux-krea", "6"),
            ("comfyui-z-image-turbo", "45"),
        ] {
            let (workflow, prompt_node_id) = workflow_for_model(model)?;
            assert_eq!(prompt_node_id, node_id);
            let patched = patch_workflow_prompt(&workflow, prompt_node_id, "a harbor at dawn")?;
            assert_eq!(
                patched[prompt_node_id]["inputs"]["text"],
                json!("a harbor at dawn")
            );
            // The template itself stays pristine for the next dispatch.
            assert_eq!(workflow[prompt_node_id]["inputs"]["text"], json!(""));
        }

        let (workflow, _) = workflow_for_model("comfyui-flux")?;
        assert_eq!(workflow["27"]["inputs"]["width"], json!(1216));
        assert_eq!(workflow["27"]["inputs"]["height"], json!(832));
        assert!(workflow_for_model("comfyui-unknown").is_err());
        assert!(patch_workflow_prompt(&json!({}), "6", "x").is_err());
        Ok(())
    }

    #[test]
    fn png_metadata_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("tagged.png");

        let mut source = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(RgbImage::new(4, 4))
            .write_to(&mut source, image::ImageFormat::Png)?;
        write_png_with_text(
            &path,
            source.get_ref(),
            &[("prompt", "a cat"), ("model", "flux-dev"), ("raw", "false")],
        )?;

        let entries = read_png_text(&path)?;
        assert!(entries.contains(&("prompt".to_string(), "a cat".to_string())));
        assert!(entries.contains(&("model".to_string(), "flux-dev".to_string())));
        assert!(entries.contains(&("raw".to_string(), "false".to_string())));
        Ok(())
    }

    #[test]
    fn newest_new_png_ignores_known_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::write(temp.path().join("old.png"), b"old")?;
        fs::write(temp.path().join("notes.txt"), b"skip")?;
        let known = png_snapshot(temp.path())?;
        assert_eq!(known.len(), 1);
        assert!(newest_new_png(temp.path(), &known)?.is_none());

        fs::write(temp.path().join("fresh.png"), b"fresh")?;
        let newest = newest_new_png(temp.path(), &known)?;
        assert_eq!(newest, Some(temp.path().join("fresh.png")));
        Ok(())
    }

    #[test]
    fn move_file_replaces_source_with_destination() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let from = temp.path().join("produced.png");
        let to = temp.path().join("kept.png");
        fs::write(&from, b"bytes")?;

        move_file(&from, &to)?;
        assert!(!from.exists());
        assert_eq!(fs::read(&to)?, b"bytes");
        Ok(())
    }

    #[test]
    fn session_calls_after_close_report_not_loaded() {
        let mut session = LocalVisionSession {
            model_tag: "llava:13b".to_string(),
            api_base: "http://127.0.0.1:11434".to_string(),
            http: HttpClient::new(),
            loaded: false,
        };
        let err = session
            .revise("make it better", None)
            .expect_err("closed session must refuse calls");
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::NotLoaded(model)) if model == "llava:13b"
        ));
        // Closing a spent session is a no-op rather than another unload.
        assert!(session.close().is_ok());
    }

    #[test]
    fn refiner_factory_honors_selection() {
        let local = build_refiner(&resolve_refiner("local-llava"));
        assert_eq!(local.name(), "local-llava");
        let hosted = build_refiner(&resolve_refiner("gpt-4o"));
        assert_eq!(hosted.name(), "gpt-4o");
    }

    #[test]
    fn artifact_file_names_embed_model_and_timestamp() {
        let name = artifact_file_name("flux-dev");
        assert!(name.starts_with("flux-dev_"));
        assert!(name.ends_with(".png"));
        let stamp = name
            .trim_start_matches("flux-dev_")
            .trim_end_matches(".png");
        assert!(stamp.parse::<u128>().is_ok());
    }
}
