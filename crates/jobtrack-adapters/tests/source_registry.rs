use std::path::{Path, PathBuf};
use std::sync::Arc;

use jobtrack_adapters::adapter_for_source;
use jobtrack_core::{AdapterKind, SourceRegistry};
use jobtrack_storage::{HttpClientConfig, HttpFetcher};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[tokio::test]
async fn every_registered_source_builds_an_adapter() {
    let root = workspace_root();
    let text = std::fs::read_to_string(root.join("sources.yaml")).expect("read sources.yaml");
    let registry: SourceRegistry = serde_yaml::from_str(&text).expect("parse sources.yaml");
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http"));

    assert!(registry.enabled().count() >= 1);
    for source in &registry.sources {
        let adapter = adapter_for_source(source, http.clone(), &root)
            .unwrap_or_else(|e| panic!("adapter for {}: {e}", source.source_id));
        assert_eq!(adapter.source_id(), source.source_id);

        if source.adapter == AdapterKind::Fixture {
            let path = root.join(source.fixture_path.as_deref().unwrap());
            assert!(path.exists(), "missing fixture {}", path.display());
            let postings = adapter.fetch_postings(source).await.expect("fixture postings");
            assert!(postings.iter().all(|p| p.company == source.company));
        }
    }
}
