//! Bundle loading from disk, covering both supported document formats and
//! the schema-subset validation that runs on parse.

use cnab_core::bundle::Bundle;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_with_suffix(contents: &str, suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn loads_json_bundle_by_extension() {
    let json = r#"{
        "schemaVersion": "1.0.0",
        "name": "helloworld",
        "version": "0.1.0",
        "invocationImages": [{"image": "example.com/helloworld:0.1.0", "imageType": "docker"}]
    }"#;
    let file = write_with_suffix(json, ".json");
    let bundle = Bundle::from_file(file.path()).unwrap();
    assert_eq!(bundle.name, "helloworld");
}

#[test]
fn loads_yaml_bundle_by_extension() {
    let yaml = "schemaVersion: 1.0.0\nname: helloworld\nversion: 0.1.0\ninvocationImages:\n  - image: example.com/helloworld:0.1.0\n    imageType: docker\n";
    let file = write_with_suffix(yaml, ".yaml");
    let bundle = Bundle::from_file(file.path()).unwrap();
    assert_eq!(bundle.name, "helloworld");
    assert_eq!(bundle.invocation_images[0].image_type_or_default(), "docker");
}

#[test]
fn rejects_bundle_with_no_invocation_images() {
    let json = r#"{
        "schemaVersion": "1.0.0",
        "name": "helloworld",
        "version": "0.1.0",
        "invocationImages": []
    }"#;
    let file = write_with_suffix(json, ".json");
    let err = Bundle::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("invocationImages"));
}

#[test]
fn bundle_with_definitions_enforces_output_type_through_schema() {
    let json = r#"{
        "schemaVersion": "1.0.0",
        "name": "helloworld",
        "version": "0.1.0",
        "invocationImages": [{"image": "x", "imageType": "docker"}],
        "definitions": {
            "port": {"type": "integer", "minimum": 1, "maximum": 65535}
        },
        "parameters": {
            "port": {"definition": "port", "destination": {"env": "PORT"}, "required": true}
        }
    }"#;
    let file = write_with_suffix(json, ".json");
    let bundle = Bundle::from_file(file.path()).unwrap();
    let definition = bundle.definition("port").unwrap();

    assert!(definition.validate(&serde_json::json!(70000)).unwrap().len() == 1);
    assert!(definition.validate(&serde_json::json!(8080)).unwrap().is_empty());
}

#[test]
fn canonical_json_round_trip_is_stable_across_a_file_load() {
    let json = r#"{
        "version": "0.1.0",
        "schemaVersion": "1.0.0",
        "name": "helloworld",
        "invocationImages": [{"imageType": "docker", "image": "example.com/helloworld:0.1.0"}]
    }"#;
    let file = write_with_suffix(json, ".json");
    let bundle = Bundle::from_file(file.path()).unwrap();
    let canonical = bundle.to_canonical_json().unwrap();

    assert!(canonical.starts_with(r#"{"invocationImages""#), "keys must sort before name/schemaVersion/version");
    assert!(!canonical.contains('\n'));
}
