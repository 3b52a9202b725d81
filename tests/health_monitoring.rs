// Probe results flowing from the health checker into routing decisions and alerts.
#[cfg(test)]
mod test {
    use std::{
        collections::{HashMap, HashSet},
        net::SocketAddr,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::body::Body;
    use http::{Request, Response, StatusCode};
    use keel::{
        adapters::{HealthChecker, MemoryRateLimitStore, MemoryRegistryStore, StaticTokenAuthenticator},
        config::{
            CircuitBreakerConfig, HealthCheckConfig, LoadBalanceAlgorithm, RateLimitSettings,
            RouteConfig,
        },
        core::{
            AlertDispatcher, AlertMonitor, AlertRules, CircuitBreakerRegistry, LoadBalancer,
            RateLimiter, RequestRouter, RouterComponents, ServiceRegistration, ServiceRegistry,
        },
        metrics::GatewayMetrics,
        ports::{
            alerts::{AlertHandler, AlertKind, HealthAlert},
            audit::TracingViolationSink,
            clock::ManualClock,
            http_client::{HttpClient, HttpClientError, HttpClientResult, ProbeResponse},
        },
    };

    /// Serves traffic from every host but fails probes for hosts marked down.
    #[derive(Default)]
    struct Fleet {
        down: Mutex<HashSet<String>>,
    }

    impl Fleet {
        fn take_down(&self, host: &str) {
            self.down.lock().unwrap().insert(host.to_string());
        }

        fn bring_up(&self, host: &str) {
            self.down.lock().unwrap().remove(host);
        }
    }

    #[async_trait]
    impl HttpClient for Fleet {
        async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
            let host = req.uri().host().unwrap_or_default().to_string();
            Ok(Response::builder()
                .header("x-served-by", host)
                .body(Body::empty())
                .unwrap())
        }

        async fn probe(&self, url: &str, _timeout: Duration) -> HttpClientResult<ProbeResponse> {
            let down = self
                .down
                .lock()
                .unwrap()
                .iter()
                .any(|host| url.contains(host.as_str()));
            if down {
                Err(HttpClientError::ConnectionError("connection refused".into()))
            } else {
                Ok(ProbeResponse::new(StatusCode::OK).with_json(r#"{"status":"ok"}"#))
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        alerts: Mutex<Vec<HealthAlert>>,
    }

    impl Recorder {
        fn kinds(&self) -> Vec<AlertKind> {
            self.alerts.lock().unwrap().iter().map(|a| a.kind).collect()
        }
    }

    impl AlertHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_alert(&self, alert: &HealthAlert) {
            self.alerts.lock().unwrap().push(alert.clone());
        }
    }

    struct Harness {
        router: RequestRouter,
        checker: HealthChecker,
        fleet: Arc<Fleet>,
        recorder: Arc<Recorder>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        async fn new(unhealthy_threshold: u32) -> Self {
            let clock = Arc::new(ManualClock::new(1_700_000_000_000));
            let store = Arc::new(MemoryRegistryStore::new(50));
            let registry = Arc::new(
                ServiceRegistry::new(store.clone(), clock.clone())
                    .with_thresholds(1, unhealthy_threshold),
            );
            for host in ["10.0.0.1", "10.0.0.2"] {
                registry
                    .register_service(ServiceRegistration::new("orders", host, 8080))
                    .await
                    .unwrap();
            }

            let fleet = Arc::new(Fleet::default());
            let balancer = Arc::new(LoadBalancer::new(LoadBalanceAlgorithm::RoundRobin));
            let components = RouterComponents {
                registry: registry.clone(),
                breakers: Arc::new(CircuitBreakerRegistry::new(
                    CircuitBreakerConfig::default(),
                    clock.clone(),
                )),
                limiter: Arc::new(RateLimiter::new(
                    RateLimitSettings::default(),
                    Arc::new(MemoryRateLimitStore::default()),
                    clock.clone(),
                    Arc::new(TracingViolationSink),
                )),
                balancer: balancer.clone(),
                authenticator: Arc::new(StaticTokenAuthenticator::new(HashMap::new())),
                client: fleet.clone(),
                metrics: Arc::new(GatewayMetrics::new()),
            };
            let router = RequestRouter::new(
                vec![RouteConfig::new("/api/orders", "orders")],
                components,
            );

            let rules = AlertRules {
                cooldown: Duration::from_secs(60),
                failure_window: 2,
                latency_window: 3,
                latency_threshold_ms: 2_000,
            };
            let dispatcher = Arc::new(AlertDispatcher::new(4));
            let recorder = Arc::new(Recorder::default());
            dispatcher.subscribe(recorder.clone()).unwrap();
            let checker = HealthChecker::new(
                registry,
                fleet.clone(),
                store,
                AlertMonitor::new(rules, clock.clone()),
                dispatcher,
                clock.clone(),
                HealthCheckConfig {
                    unhealthy_threshold,
                    ..HealthCheckConfig::default()
                },
            )
            .with_load_balancer(balancer);

            Self {
                router,
                checker,
                fleet,
                recorder,
                clock,
            }
        }

        async fn served_by(&self, requests: usize) -> Vec<String> {
            let peer: SocketAddr = "198.51.100.7:40000".parse().unwrap();
            let mut hosts = Vec::with_capacity(requests);
            for _ in 0..requests {
                let req = Request::builder()
                    .uri("/api/orders")
                    .body(Body::empty())
                    .unwrap();
                let response = self.router.handle(req, Some(peer)).await;
                assert_eq!(response.status(), StatusCode::OK);
                hosts.push(
                    response.headers()["x-served-by"]
                        .to_str()
                        .unwrap()
                        .to_string(),
                );
            }
            hosts
        }
    }

    #[tokio::test]
    async fn failed_probe_takes_instance_out_of_rotation() {
        let h = Harness::new(1).await;
        let report = h.checker.run_once().await;
        assert_eq!((report.probed, report.healthy), (2, 2));

        h.fleet.take_down("10.0.0.2");
        let report = h.checker.run_once().await;
        assert_eq!((report.probed, report.healthy), (2, 1));

        let hosts = h.served_by(6).await;
        assert!(hosts.iter().all(|host| host == "10.0.0.1"), "{hosts:?}");

        h.fleet.bring_up("10.0.0.2");
        h.checker.run_once().await;
        let hosts = h.served_by(6).await;
        assert!(hosts.iter().any(|host| host == "10.0.0.2"), "{hosts:?}");
    }

    #[tokio::test]
    async fn single_failure_below_threshold_keeps_routing() {
        let h = Harness::new(2).await;
        h.fleet.take_down("10.0.0.2");

        h.checker.run_once().await;
        let hosts = h.served_by(4).await;
        assert!(hosts.iter().any(|host| host == "10.0.0.2"));

        h.checker.run_once().await;
        let hosts = h.served_by(4).await;
        assert!(hosts.iter().all(|host| host == "10.0.0.1"));
    }

    #[tokio::test]
    async fn whole_service_down_raises_one_alert_and_recovers() {
        let h = Harness::new(1).await;
        h.fleet.take_down("10.0.0.1");
        h.fleet.take_down("10.0.0.2");

        h.checker.run_once().await;
        assert!(h.recorder.kinds().is_empty());

        let peer: SocketAddr = "198.51.100.7:40000".parse().unwrap();
        let req = Request::builder()
            .uri("/api/orders")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            h.router.handle(req, Some(peer)).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let report = h.checker.run_once().await;
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(h.recorder.kinds(), vec![AlertKind::ServiceDown]);

        // still inside the cooldown
        h.clock.advance(10_000);
        h.checker.run_once().await;
        assert_eq!(h.recorder.kinds(), vec![AlertKind::ServiceDown]);

        h.fleet.bring_up("10.0.0.1");
        h.checker.run_once().await;
        assert_eq!(
            h.recorder.kinds(),
            vec![AlertKind::ServiceDown, AlertKind::Recovered]
        );
        assert_eq!(h.served_by(2).await, vec!["10.0.0.1", "10.0.0.1"]);
    }

    #[tokio::test]
    async fn uptime_reflects_probe_history() {
        let h = Harness::new(1).await;
        let id = h
            .router
            .components()
            .registry
            .get_healthy_instances("orders")
            .await
            .into_iter()
            .find(|i| i.host == "10.0.0.2")
            .unwrap()
            .id;

        assert_eq!(
            h.checker
                .uptime_percentage(&id, Duration::from_secs(3600))
                .await
                .unwrap(),
            None
        );

        h.checker.run_once().await;
        h.checker.run_once().await;
        h.fleet.take_down("10.0.0.2");
        h.checker.run_once().await;
        h.checker.run_once().await;

        let uptime = h
            .checker
            .uptime_percentage(&id, Duration::from_secs(3600))
            .await
            .unwrap()
            .unwrap();
        assert!((uptime - 50.0).abs() < f64::EPSILON);
    }
}
