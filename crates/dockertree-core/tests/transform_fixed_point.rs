//! The compose transformer is a fixed point on its own output, through
//! file I/O, for a realistic multi-service stack.

use dockertree_core::transform::ComposeTransformer;
use dockertree_core::ProjectConfig;

const STACK: &str = r#"
services:
  web:
    build:
      context: .
      dockerfile: Dockerfile
      target: production
    container_name: shop-web
    command: gunicorn shop.wsgi --bind 0.0.0.0:8000
    ports:
      - "127.0.0.1:8000:8000"
    environment:
      - DEBUG=${DEBUG:-False}
      - DATABASE_URL=${DATABASE_URL}
    volumes:
      - media_files:/app/media
      - ./static:/app/static
    healthcheck:
      test: ["CMD", "curl", "-f", "http://localhost:8000/health/"]
      interval: 30s
    depends_on:
      db:
        condition: service_healthy
  db:
    image: postgres:16
    ports:
      - "5432:5432"
    volumes:
      - postgres_data:/var/lib/postgresql/data
    healthcheck:
      test: ["CMD-SHELL", "pg_isready -U postgres"]
  redis:
    image: redis:7
    ports:
      - "6379:6379"
volumes:
  postgres_data:
  redis_data:
  media_files:
"#;

fn project_config() -> ProjectConfig {
    let mut config = ProjectConfig::new("shop");
    config.volumes = vec![
        "postgres_data".into(),
        "redis_data".into(),
        "media_files".into(),
    ];
    config
}

#[test]
fn transform_file_is_idempotent_byte_for_byte() {
    let config = project_config();
    let transformer = ComposeTransformer::new(&config);
    let dir = tempfile::tempdir().unwrap();

    let source = dir.path().join("docker-compose.yml");
    std::fs::write(&source, STACK).unwrap();

    let once = dir.path().join("once.yml");
    transformer.transform_file(&source, &once).unwrap();
    let twice = dir.path().join("twice.yml");
    transformer.transform_file(&once, &twice).unwrap();

    let first = std::fs::read_to_string(&once).unwrap();
    let second = std::fs::read_to_string(&twice).unwrap();
    assert_eq!(first, second);
}

#[test]
fn semantics_are_preserved_through_the_rewrite() {
    let config = project_config();
    let transformer = ComposeTransformer::new(&config);
    let output = transformer.transform_str(STACK).unwrap();
    let doc: serde_yaml::Value = serde_yaml::from_str(&output).unwrap();

    // Command, healthcheck, bind mounts, and depends_on survive verbatim.
    let web = &doc["services"]["web"];
    assert_eq!(
        web["command"].as_str(),
        Some("gunicorn shop.wsgi --bind 0.0.0.0:8000")
    );
    assert_eq!(web["healthcheck"]["interval"].as_str(), Some("30s"));
    assert!(web["volumes"]
        .as_sequence()
        .unwrap()
        .iter()
        .any(|v| v.as_str() == Some("./static:/app/static")));
    assert!(web["depends_on"]["db"]["condition"].is_string());

    // The host-IP prefix on the web port mapping is stripped.
    assert_eq!(
        web["ports"][0].as_str(),
        Some("${DOCKERTREE_WEB_HOST_PORT:-0}:8000")
    );

    // List-form environment keeps the substitution entries.
    let env: Vec<&str> = web["environment"]
        .as_sequence()
        .unwrap()
        .iter()
        .filter_map(|e| e.as_str())
        .collect();
    assert!(env.contains(&"DEBUG=${DEBUG:-False}"));
    assert!(env.contains(&"COMPOSE_PROJECT_NAME=${COMPOSE_PROJECT_NAME}"));
}
