//! Property-based tests for flow routing and exception matching

use crate::dispatcher::{route_tcp, route_udp, TcpPath, UdpPath};
use crate::exception::ExceptionSet;
use crate::flow::FlowMeta;
use proptest::prelude::*;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

fn app_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,11}"
}

fn socket_strategy() -> impl Strategy<Value = SocketAddr> {
    (any::<u32>(), 1u16..=65535)
        .prop_map(|(ip, port)| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
}

fn meta_strategy() -> impl Strategy<Value = FlowMeta> {
    (
        socket_strategy(),
        socket_strategy(),
        prop::option::of(app_strategy()),
    )
        .prop_map(|(source, destination, process)| {
            let mut meta = FlowMeta::udp(source, destination);
            meta.process = process;
            meta
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Routing depends only on the process, the exception set and the UDP
    /// flag, never on the endpoints.
    #[test]
    fn test_udp_route_ignores_endpoints(
        meta in meta_strategy(),
        other in socket_strategy(),
        apps in prop::collection::vec(app_strategy(), 0..5),
        udp_enabled in any::<bool>(),
    ) {
        let exceptions = ExceptionSet::new(&apps);
        let mut moved = meta.clone();
        moved.destination = other;

        prop_assert_eq!(
            route_udp(&meta, &exceptions, udp_enabled),
            route_udp(&moved, &exceptions, udp_enabled)
        );
        // pure: same inputs, same answer
        prop_assert_eq!(
            route_udp(&meta, &exceptions, udp_enabled),
            route_udp(&meta, &exceptions, udp_enabled)
        );
    }

    #[test]
    fn test_excepted_flows_always_direct(
        meta in meta_strategy(),
        app in app_strategy(),
        apps in prop::collection::vec(app_strategy(), 0..5),
        udp_enabled in any::<bool>(),
    ) {
        let mut apps = apps;
        apps.push(app.clone());
        let exceptions = ExceptionSet::new(&apps);
        let meta = meta.with_process(app.to_uppercase());

        prop_assert_eq!(route_udp(&meta, &exceptions, udp_enabled), UdpPath::Direct);
        prop_assert_eq!(route_tcp(&meta, &exceptions), TcpPath::Direct);
    }

    #[test]
    fn test_unexcepted_udp_follows_flag(
        meta in meta_strategy(),
        udp_enabled in any::<bool>(),
    ) {
        let exceptions = ExceptionSet::default();
        let expected = if udp_enabled { UdpPath::Proxy } else { UdpPath::DnsFallback };

        prop_assert_eq!(route_udp(&meta, &exceptions, udp_enabled), expected);
        prop_assert_eq!(route_tcp(&meta, &exceptions), TcpPath::Proxy);
    }

    #[test]
    fn test_exception_set_ignores_path_and_case(app in app_strategy()) {
        let exceptions = ExceptionSet::new([format!("/system/bin/{}", app)]);
        prop_assert!(exceptions.contains(&app));
        prop_assert!(exceptions.contains(&app.to_uppercase()));
        let windows_path = format!("C:\\Apps\\{}.exe", app);
        prop_assert!(exceptions.contains(&windows_path));
    }
}
