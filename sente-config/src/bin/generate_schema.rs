use schemars::schema_for;
use sente_config::config::AppConfig;

fn main() {
    let schema = schema_for!(AppConfig);
    std::fs::write(
        "config.schema.json",
        serde_json::to_string_pretty(&schema).unwrap(),
    )
    .expect("Unable to write file");
}
