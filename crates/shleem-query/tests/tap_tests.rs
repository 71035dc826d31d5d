use futures::{StreamExt, TryStreamExt};
use serde_json::{json, Value};
use shleem_query::{
    content_hash, Catalog, CatalogConfig, Collection, CredentialStore, DataSource, MemoryDriver,
    Projection, QueryOptions, Record, ServerCredentials, Source, SourceKind, TapArgs, TapError,
    Tappable, Template,
};
use std::sync::Arc;

struct Fixture {
    driver: MemoryDriver,
    catalog: Catalog<MemoryDriver>,
}

impl Fixture {
    fn new() -> Self {
        let driver = MemoryDriver::new();

        let mut orders = Vec::new();
        for i in 0..40 {
            let status = if i % 4 == 3 { "closed" } else { "open" };
            orders.push(json!({"_id": i, "status": status, "total": i * 5}));
        }
        driver.insert_many("primary", "shop", "orders", orders);

        let credentials = CredentialStore::new().with_server(
            "primary",
            ServerCredentials::new(vec!["localhost:27017".to_string()], "reader", "secret"),
        );
        let catalog = Catalog::new(driver.clone(), credentials, CatalogConfig::new());
        Self { driver, catalog }
    }

    fn orders(&self) -> Arc<Collection<MemoryDriver>> {
        self.catalog.server("primary").database("shop").collection("orders")
    }
}

async fn collect(tap: &dyn Tappable, args: &TapArgs) -> Vec<Record> {
    tap.tap(args).await.unwrap().try_collect().await.unwrap()
}

fn ids(records: &[Record]) -> Vec<i64> {
    records
        .iter()
        .map(|r| r.get("_id").and_then(Value::as_i64).unwrap())
        .collect()
}

#[tokio::test]
async fn test_query_identifier_and_tap() {
    let fixture = Fixture::new();
    let template = Template::from(json!({"status": "open"}));
    let open_orders = fixture.orders().query(template.clone()).unwrap();

    let expected = format!("primary.shop.orders.{}", content_hash(&template).unwrap());
    assert_eq!(open_orders.identifier(), expected);
    assert_eq!(open_orders.kind(), SourceKind::Query);
    assert_eq!(
        open_orders.to_string(),
        format!("Memory query source: {}", expected)
    );

    let records = collect(&open_orders, &TapArgs::new()).await;
    assert_eq!(records.len(), 30);
    assert!(records.iter().all(|r| r["status"] == "open"));
}

#[tokio::test]
async fn test_identical_templates_share_an_identifier() {
    let fixture = Fixture::new();
    let orders = fixture.orders();

    let a = orders
        .query(Template::doc([
            ("status", Template::from("open")),
            ("total", Template::doc([("$gte", Template::param("min"))])),
        ]))
        .unwrap();
    let b = orders
        .query(Template::doc([
            ("total", Template::doc([("$gte", Template::param("min"))])),
            ("status", Template::from("open")),
        ]))
        .unwrap();
    let c = orders
        .query(Template::doc([
            ("status", Template::from("open")),
            ("total", Template::doc([("$gte", Template::param("max"))])),
        ]))
        .unwrap();

    assert_eq!(a.identifier(), b.identifier());
    assert_ne!(a.identifier(), c.identifier());

    let other = fixture.catalog.server("primary").database("shop").collection("customers");
    let d = other.query(Template::from(json!({"status": "open"}))).unwrap();
    let e = orders.query(Template::from(json!({"status": "open"}))).unwrap();
    assert_ne!(d.identifier(), e.identifier());
    assert!(d.identifier().starts_with("primary.shop.customers."));
}

#[tokio::test]
async fn test_explicit_identifier() {
    let fixture = Fixture::new();
    let query = fixture
        .orders()
        .query_with(
            Template::from(json!({"status": "open"})),
            QueryOptions::new().with_identifier("open_orders"),
        )
        .unwrap();
    assert_eq!(query.identifier(), "primary.shop.orders.open_orders");
}

#[tokio::test]
async fn test_parameterized_query_with_different_arguments() {
    let fixture = Fixture::new();
    let query = fixture
        .orders()
        .query(Template::doc([(
            "total",
            Template::doc([
                ("$gte", Template::param("min")),
                ("$lte", Template::param("max")),
            ]),
        )]))
        .unwrap();

    let first = collect(&query, &TapArgs::new().with("min", 10).with("max", 20)).await;
    assert_eq!(ids(&first), vec![2, 3, 4]);

    let second = collect(&query, &TapArgs::new().with("min", 100).with("max", 110)).await;
    assert_eq!(ids(&second), vec![20, 21, 22]);

    match query.tap(&TapArgs::new()).await {
        Err(TapError::MissingParameter { name }) => assert!(name == "min" || name == "max"),
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("expected a missing parameter error"),
    }
}

#[tokio::test]
async fn test_derived_parameter() {
    let fixture = Fixture::new();
    let query = fixture
        .orders()
        .query(Template::doc([(
            "total",
            Template::doc([(
                "$gt",
                Template::derived("threshold", |args| {
                    let base = args.require("base")?.as_i64().unwrap_or(0);
                    let factor = args.get("factor").and_then(Value::as_i64).unwrap_or(1);
                    Ok(json!(base * factor))
                }),
            )]),
        )]))
        .unwrap();

    let records = collect(&query, &TapArgs::new().with("base", 90).with("factor", 2)).await;
    assert_eq!(ids(&records), vec![37, 38, 39]);
}

#[tokio::test]
async fn test_skip_and_limit() {
    let fixture = Fixture::new();
    let query = fixture
        .orders()
        .query_with(
            Template::doc(Vec::<(String, Template)>::new()),
            QueryOptions::new().with_skip(10).with_limit(17),
        )
        .unwrap();
    assert_eq!(query.skip(), 10);
    assert_eq!(query.limit(), Some(17));

    let records = collect(&query, &TapArgs::new()).await;
    assert_eq!(records.len(), 17);
    assert_eq!(ids(&records), (10..27).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_zero_limit_returns_nothing() {
    let fixture = Fixture::new();
    let query = fixture
        .orders()
        .query_with(
            Template::from(json!({"status": "open"})),
            QueryOptions::new().with_limit(0),
        )
        .unwrap();

    let records = collect(&query, &TapArgs::new()).await;
    assert!(records.is_empty());
    // nothing was fetched, so no connection was opened
    assert_eq!(fixture.driver.connect_count(), 0);
}

#[tokio::test]
async fn test_projection() {
    let fixture = Fixture::new();
    let query = fixture
        .orders()
        .query_with(
            Template::from(json!({"_id": 5})),
            QueryOptions::new().with_projection(Projection::fields(["total"])),
        )
        .unwrap();

    let records = collect(&query, &TapArgs::new()).await;
    assert_eq!(records.len(), 1);
    assert_eq!(Value::Object(records[0].clone()), json!({"_id": 5, "total": 25}));
}

#[tokio::test]
async fn test_tap_is_lazy_and_reflects_fetch_time() {
    let fixture = Fixture::new();
    let query = fixture
        .orders()
        .query(Template::from(json!({"status": "pending"})))
        .unwrap();

    assert!(collect(&query, &TapArgs::new()).await.is_empty());

    fixture.driver.insert_many(
        "primary",
        "shop",
        "orders",
        vec![json!({"_id": 100, "status": "pending"})],
    );
    let mut stream = query.tap(&TapArgs::new()).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first["_id"], 100);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_aggregation() {
    let fixture = Fixture::new();
    let pipeline = vec![
        Template::from(json!({"$match": {"total": {"$lt": 40}}})),
        Template::from(json!({"$group": {"_id": "$status", "count": {"$sum": 1}}})),
    ];
    let counts = fixture.orders().aggregation(pipeline.clone()).unwrap();

    let expected = format!(
        "primary.shop.orders.{}",
        content_hash(&Template::Array(pipeline)).unwrap()
    );
    assert_eq!(counts.identifier(), expected);
    assert_eq!(counts.kind(), SourceKind::Aggregation);
    assert_eq!(counts.stages().len(), 2);

    let records = collect(&counts, &TapArgs::new()).await;
    let by_status: Vec<(String, i64)> = records
        .iter()
        .map(|r| {
            (
                r["_id"].as_str().unwrap().to_string(),
                r["count"].as_i64().unwrap(),
            )
        })
        .collect();
    assert_eq!(
        by_status,
        vec![("open".to_string(), 6), ("closed".to_string(), 2)]
    );
}

#[tokio::test]
async fn test_parameterized_aggregation_keeps_stage_order() {
    let fixture = Fixture::new();
    let paged = fixture
        .orders()
        .aggregation(vec![
            Template::from(json!({"$sort": {"total": -1}})),
            Template::doc([("$skip", Template::param("offset"))]),
            Template::doc([("$limit", Template::param("size"))]),
        ])
        .unwrap();

    let records = collect(&paged, &TapArgs::new().with("offset", 2).with("size", 3)).await;
    assert_eq!(ids(&records), vec![37, 36, 35]);

    let reordered = fixture
        .orders()
        .aggregation(vec![
            Template::doc([("$limit", Template::param("size"))]),
            Template::doc([("$skip", Template::param("offset"))]),
            Template::from(json!({"$sort": {"total": -1}})),
        ])
        .unwrap();
    assert_ne!(paged.identifier(), reordered.identifier());
}

#[tokio::test]
async fn test_invalid_templates() {
    let fixture = Fixture::new();
    let orders = fixture.orders();

    assert!(matches!(
        orders.query(Template::from(json!(["status"]))).err(),
        Some(TapError::InvalidTemplate(_))
    ));
    assert!(matches!(
        orders.aggregation(vec![Template::from("$match")]).err(),
        Some(TapError::InvalidTemplate(_))
    ));
    assert!(matches!(
        orders
            .query(Template::doc([("x", Template::Float(f64::NAN))]))
            .err(),
        Some(TapError::UnhashableTemplate(_))
    ));

    // an explicit identifier skips hashing
    let query = orders
        .query_with(
            Template::doc([("x", Template::Float(f64::NAN))]),
            QueryOptions::new().with_identifier("nan"),
        )
        .unwrap();
    assert_eq!(query.identifier(), "primary.shop.orders.nan");

    // a root slot must resolve to a mapping
    let dynamic = orders.query(Template::param("filter")).unwrap();
    assert!(matches!(
        dynamic.tap(&TapArgs::new().with("filter", 3)).await.err(),
        Some(TapError::InvalidTemplate(_))
    ));
    let records = collect(&dynamic, &TapArgs::new().with("filter", json!({"_id": 1}))).await;
    assert_eq!(ids(&records), vec![1]);
}

#[tokio::test]
async fn test_source_union_exposes_tap() {
    let fixture = Fixture::new();
    let query = fixture
        .orders()
        .query(Template::from(json!({"status": "closed"})))
        .unwrap();
    let source: Source<MemoryDriver> = query.into();

    assert_eq!(source.kind(), SourceKind::Query);
    let tap = source.as_tap().unwrap();
    let records = collect(tap, &TapArgs::new()).await;
    assert_eq!(records.len(), 10);
}

#[tokio::test]
async fn test_template_is_not_mutated_by_tap() {
    let fixture = Fixture::new();
    let template = Template::doc([("_id", Template::param("id"))]);
    let query = fixture.orders().query(template.clone()).unwrap();

    collect(&query, &TapArgs::new().with("id", 4)).await;
    assert_eq!(query.template(), &template);
    assert!(query.template().has_params());
}
