//! Static HTML rendering of validation predictions.

use mosaic_abstraction::{parse_args, ComponentArgs, ComponentResult, PredictionSample, VisualArtifacts, Visualizer};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::debug;

fn default_num_samples() -> usize {
    10
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HtmlArgs {
    exp_name: String,
    web_dir: PathBuf,
    #[serde(default = "default_num_samples")]
    num_samples: usize,
}

#[derive(Debug, Serialize)]
struct StepPage<'a> {
    step: u64,
    epoch: u64,
    metrics: &'a std::collections::BTreeMap<String, f64>,
    samples: &'a [PredictionSample],
}

/// Writes `step-<n>.json` per render and keeps `index.html` listing them.
#[derive(Debug)]
pub struct HtmlVisualizer {
    exp_name: String,
    web_dir: PathBuf,
    num_samples: usize,
    rendered: Vec<(u64, u64)>,
}

impl HtmlVisualizer {
    pub const KIND: &'static str = "HtmlVisualizer";

    pub fn from_args(args: &ComponentArgs) -> ComponentResult<Self> {
        let args: HtmlArgs = parse_args(args)?;
        Ok(Self { exp_name: args.exp_name, web_dir: args.web_dir, num_samples: args.num_samples, rendered: Vec::new() })
    }

    fn index_html(&self, latest: &VisualArtifacts) -> String {
        let mut html = String::new();
        let _ = writeln!(html, "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{}</title></head><body>", escape(&self.exp_name));
        let _ = writeln!(html, "<h1>{}</h1>", escape(&self.exp_name));

        html.push_str("<h2>Latest validation</h2>\n<table><tr><th>metric</th><th>value</th></tr>\n");
        for (name, value) in &latest.metrics {
            let _ = writeln!(html, "<tr><td>{}</td><td>{value:.6}</td></tr>", escape(name));
        }
        html.push_str("</table>\n<table><tr><th>text</th><th>prediction</th><th>label</th></tr>\n");
        for sample in latest.samples.iter().take(self.num_samples) {
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td>{:.4}</td><td>{:.4}</td></tr>",
                escape(&sample.text),
                sample.prediction,
                sample.label
            );
        }
        html.push_str("</table>\n<h2>History</h2>\n<ul>\n");
        for (step, epoch) in self.rendered.iter().rev() {
            let _ = writeln!(html, "<li><a href=\"step-{step}.json\">step {step}</a> (epoch {epoch})</li>");
        }
        html.push_str("</ul>\n</body></html>\n");
        html
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

impl Visualizer for HtmlVisualizer {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn render(&mut self, step: u64, artifacts: &VisualArtifacts) -> ComponentResult<()> {
        std::fs::create_dir_all(&self.web_dir)?;

        let samples = &artifacts.samples[..artifacts.samples.len().min(self.num_samples)];
        let page = StepPage { step, epoch: artifacts.epoch, metrics: &artifacts.metrics, samples };
        std::fs::write(self.web_dir.join(format!("step-{step}.json")), serde_json::to_vec_pretty(&page)?)?;

        self.rendered.retain(|(s, _)| *s != step);
        self.rendered.push((step, artifacts.epoch));
        std::fs::write(self.web_dir.join("index.html"), self.index_html(artifacts))?;
        debug!(step, dir = %self.web_dir.display(), "Rendered validation artifacts");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifacts(epoch: u64) -> VisualArtifacts {
        VisualArtifacts {
            epoch,
            metrics: [("val_loss".to_string(), 0.5)].into_iter().collect(),
            samples: (0..5)
                .map(|i| PredictionSample { text: format!("<b>{i}</b>"), prediction: 0.1, label: 1.0 })
                .collect(),
        }
    }

    #[test]
    fn test_render_creates_dir_and_pages() {
        let temp = TempDir::new().unwrap();
        let web_dir = temp.path().join("web/run");
        let mut args = ComponentArgs::new();
        args.insert("exp_name".to_string(), serde_json::json!("demo"));
        args.insert("web_dir".to_string(), serde_json::json!(web_dir));
        args.insert("num_samples".to_string(), serde_json::json!(2));
        let mut vis = HtmlVisualizer::from_args(&args).unwrap();
        assert!(!web_dir.exists());

        vis.render(10, &artifacts(1)).unwrap();
        vis.render(20, &artifacts(2)).unwrap();

        let page: serde_json::Value =
            serde_json::from_slice(&std::fs::read(web_dir.join("step-20.json")).unwrap()).unwrap();
        assert_eq!(page["samples"].as_array().unwrap().len(), 2);
        assert_eq!(page["epoch"], 2);

        let index = std::fs::read_to_string(web_dir.join("index.html")).unwrap();
        assert!(index.contains("step-10.json"));
        assert!(index.contains("&lt;b&gt;0&lt;/b&gt;"));
    }
}
