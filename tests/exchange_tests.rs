//! End-to-end tests: registry, codecs and migrations working together

use std::sync::Arc;

use familiar_exchange::codec::compression::{CompressionAlgorithm, CompressionSettings, CompressionStage};
use familiar_exchange::codec::AvroCodec;
use familiar_exchange::config::{BackendKind, CodecConfig, MigrationConfig, RegistryConfig};
use familiar_exchange::{
    build_codec, ExchangeError, Message, MessageCodec, MessageDraft, SchemaRegistry, SchemaVersion,
    SerializationFormat, VersionTransformer,
};
use serde_json::{json, Value};

const ORDER_V1: &str = include_str!("fixtures/order_v1.avsc");
const ORDER_V2: &str = include_str!("fixtures/order_v2.avsc");
const ORDER_RULES: &str = include_str!("fixtures/order_v1_to_v2.json");

fn order_data(lines: usize) -> Value {
    let lines: Vec<Value> = (0..lines)
        .map(|i| json!({"sku": format!("SKU-{:04}", i), "qty": (i % 5) as i64 + 1}))
        .collect();
    json!({
        "order_id": 1001,
        "customer": "Ada Lovelace",
        "total": 149.95,
        "status": "PAID",
        "lines": lines,
        "note": null
    })
}

fn order_message(version: &str, data: Value) -> Message {
    MessageDraft::new("orders", version, data).build_now().unwrap()
}

async fn registry_with_orders() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::in_memory(RegistryConfig::default());
    registry.register("Order", ORDER_V1, "1.0.0").await.unwrap();
    registry.register("Order", ORDER_V2, "2.0.0").await.unwrap();
    Arc::new(registry)
}

fn codecs(registry: &Arc<SchemaRegistry>, config: &CodecConfig) -> Vec<Box<dyn MessageCodec>> {
    [SerializationFormat::Json, SerializationFormat::Compact, SerializationFormat::Avro]
        .into_iter()
        .map(|format| build_codec(format, config, Some((registry.clone(), "Order".to_string()))).unwrap())
        .collect()
}

#[tokio::test]
async fn test_every_format_roundtrips() {
    let registry = registry_with_orders().await;
    let message = order_message("1.0.0", order_data(3));

    for codec in codecs(&registry, &CodecConfig::default()) {
        let encoded = codec.serialize(&message).unwrap();
        assert_eq!(encoded.format, codec.format());
        assert_eq!(encoded.compression_ratio, 1.0);

        let decoded = codec.deserialize(&encoded.bytes).unwrap();
        assert_eq!(decoded.message_id(), message.message_id(), "{}", codec.format());
        assert_eq!(decoded.data(), message.data(), "{}", codec.format());
        assert_eq!(decoded.schema_version(), message.schema_version());
        decoded.verify_integrity().unwrap();
    }
}

#[tokio::test]
async fn test_large_messages_compress_in_every_format() {
    let registry = registry_with_orders().await;
    let mut config = CodecConfig::default();
    config.compression = CompressionSettings {
        algorithm: CompressionAlgorithm::Gzip,
        level: None,
        threshold: 1024,
    };
    let message = order_message("1.0.0", order_data(400));

    for codec in codecs(&registry, &config) {
        let encoded = codec.serialize(&message).unwrap();
        assert_eq!(encoded.compression, CompressionAlgorithm::Gzip, "{}", codec.format());
        assert!(encoded.compressed_size < encoded.original_size);
        assert!(encoded.compression_ratio > 1.0);
        assert_eq!(codec.deserialize(&encoded.bytes).unwrap().data(), message.data());
    }
}

#[test]
fn test_tiny_body_is_not_compressed() {
    let stage = CompressionStage::new(CompressionSettings {
        algorithm: CompressionAlgorithm::Brotli,
        level: None,
        threshold: 0,
    });
    let compressed = stage.apply(b"0123456789".to_vec());
    assert_eq!(compressed.algorithm, CompressionAlgorithm::None);
    assert_eq!(compressed.bytes, b"0123456789");
}

#[tokio::test]
async fn test_binary_codec_rejects_invalid_data() {
    let registry = registry_with_orders().await;
    let codec = AvroCodec::new(registry, "Order", CodecConfig::default());

    let mut data = order_data(1);
    data["status"] = json!("LOST");
    let err = codec.serialize(&order_message("1.0.0", data)).unwrap_err();
    assert!(matches!(err, ExchangeError::Validation { .. }), "{err}");

    let err = codec.serialize(&order_message("9.0.0", order_data(1))).unwrap_err();
    assert!(matches!(err, ExchangeError::NotFound { .. }), "{err}");
}

#[tokio::test]
async fn test_binary_codec_integrity_values() {
    let registry = registry_with_orders().await;
    let codec = AvroCodec::new(registry, "Order", CodecConfig::default());
    let encoded = codec.serialize(&order_message("1.0.0", order_data(2))).unwrap();
    let crc = encoded.crc32.unwrap();
    let hash = encoded.content_hash.clone().unwrap();

    codec.deserialize_verified(&encoded.bytes, crc, &hash).unwrap();
    let err = codec.deserialize_verified(&encoded.bytes, crc ^ 1, &hash).unwrap_err();
    assert!(matches!(err, ExchangeError::CrcMismatch { .. }));
}

#[tokio::test]
async fn test_consumer_migrates_after_decode() {
    let registry = registry_with_orders().await;
    let producer = AvroCodec::new(registry.clone(), "Order", CodecConfig::default());
    let encoded = producer.serialize(&order_message("1.0.0", order_data(2))).unwrap();
    let received = producer.deserialize(&encoded.bytes).unwrap();

    let mut transformer =
        VersionTransformer::new(MigrationConfig { validate_result: true }).with_registry(registry.clone(), "Order");
    transformer.load_rules(ORDER_RULES).unwrap();

    let target = SchemaVersion::new(2, 0, 0);
    let result = transformer.migrate(&received, &target);
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.applied_rules.len(), 2);
    let migrated = result.message.unwrap();
    assert_eq!(migrated.schema_version(), &target);
    assert_eq!(migrated.data()["channel"], json!("web"));
    assert_eq!(migrated.data()["customer"], json!("ada lovelace"));

    // The migrated message encodes against the newer schema
    let consumer = AvroCodec::new(registry, "Order", CodecConfig::default());
    let reencoded = consumer.serialize(&migrated).unwrap();
    assert_eq!(consumer.deserialize(&reencoded.bytes).unwrap().data(), migrated.data());
}

#[tokio::test]
async fn test_filesystem_registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = RegistryConfig {
        backend: BackendKind::Filesystem,
        path: dir.path().to_path_buf(),
        ..RegistryConfig::default()
    };

    {
        let registry = SchemaRegistry::from_config(config.clone()).unwrap();
        registry.register("Order", ORDER_V1, "1.0.0").await.unwrap();
        registry.register("Order", ORDER_V2, "1.10.0").await.unwrap();
        registry.register("Order", ORDER_V2, "1.2.0").await.unwrap();
    }
    assert!(dir.path().join("Order_1.0.0.avsc").exists());

    let registry = SchemaRegistry::from_config(config).unwrap();
    assert_eq!(registry.hydrate().await.unwrap(), 3);
    let versions: Vec<String> = registry
        .get_schema_versions("Order")
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(versions, vec!["1.0.0", "1.2.0", "1.10.0"]);
    assert_eq!(registry.get_latest_version("Order"), Some(SchemaVersion::new(1, 10, 0)));

    let compiled = registry.compiled("Order", &SchemaVersion::new(1, 0, 0)).unwrap();
    compiled.validate(&order_data(1)).unwrap();

    assert_eq!(registry.delete("Order", None).await.unwrap(), 3);
    assert!(registry.get_schema_versions("Order").is_empty());
    assert!(!dir.path().join("Order_1.0.0.avsc").exists());
}
