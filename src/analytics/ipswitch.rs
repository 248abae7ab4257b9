use serde::Serialize;

/// A v4/v6 transition inside this interval is treated as the same
/// physical host switching stacks, not a real IP change.
const DUAL_STACK_WINDOW_SECS: i64 = 60;

/// A real switch at or under this interval counts as rapid.
const RAPID_SWITCH_SECS: i64 = 60;

/// Number of trailing switch details returned to callers.
const DETAIL_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct SwitchDetail {
    pub time: i64,
    pub from_ip: String,
    pub to_ip: String,
    pub interval: i64,
    pub is_dual_stack: bool,
    pub from_version: &'static str,
    pub to_version: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IpSwitchAnalysis {
    pub total_switches: usize,
    pub real_switch_count: usize,
    pub rapid_switch_count: usize,
    pub dual_stack_switches: usize,
    pub unique_ips: usize,
    /// Mean seconds an IP stayed active before being switched away from.
    pub avg_ip_duration: f64,
    /// Minimum interval between real (non-dual-stack) switches.
    pub min_switch_interval: Option<i64>,
    pub switch_details: Vec<SwitchDetail>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckinAnalysis {
    pub checkin_count: i64,
    pub request_count: i64,
    pub requests_per_checkin: f64,
    pub anomalous: bool,
}

fn ip_version(ip: &str) -> &'static str {
    if ip.contains(':') { "v6" } else { "v4" }
}

/// Walk a time-ordered `(created_at, ip)` sequence and classify every
/// transition.
pub fn analyze_ip_switches(events: &[(i64, String)]) -> IpSwitchAnalysis {
    let mut out = IpSwitchAnalysis::default();
    if events.is_empty() {
        return out;
    }

    let mut unique: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let mut details: Vec<SwitchDetail> = Vec::new();
    let mut durations: Vec<i64> = Vec::new();

    let mut current_ip = events[0].1.as_str();
    let mut current_since = events[0].0;
    let mut last_seen = events[0].0;
    unique.insert(current_ip);

    for (ts, ip) in &events[1..] {
        unique.insert(ip.as_str());
        if ip != current_ip {
            let interval = ts - last_seen;
            let from_version = ip_version(current_ip);
            let to_version = ip_version(ip);
            let is_dual_stack =
                from_version != to_version && interval <= DUAL_STACK_WINDOW_SECS;

            details.push(SwitchDetail {
                time: *ts,
                from_ip: current_ip.to_string(),
                to_ip: ip.clone(),
                interval,
                is_dual_stack,
                from_version,
                to_version,
            });

            durations.push(*ts - current_since);

            if is_dual_stack {
                out.dual_stack_switches += 1;
            } else {
                out.real_switch_count += 1;
                if interval <= RAPID_SWITCH_SECS {
                    out.rapid_switch_count += 1;
                }
                out.min_switch_interval = Some(match out.min_switch_interval {
                    Some(min) => min.min(interval),
                    None => interval,
                });
            }

            current_ip = ip.as_str();
            current_since = *ts;
        }
        last_seen = *ts;
    }

    out.total_switches = details.len();
    out.unique_ips = unique.len();
    if !durations.is_empty() {
        out.avg_ip_duration =
            durations.iter().sum::<i64>() as f64 / durations.len() as f64;
    }
    if details.len() > DETAIL_LIMIT {
        details.drain(..details.len() - DETAIL_LIMIT);
    }
    out.switch_details = details;
    out
}

/// Summary-level inputs to flag derivation.
#[derive(Debug, Clone, Default)]
pub struct FlagInputs {
    pub requests_per_minute: f64,
    pub unique_ips: usize,
    pub total_requests: i64,
    pub failure_rate: f64,
}

/// Derive the risk flags for a user from the switch analysis and the
/// summary stats. Flag names are part of the API contract.
pub fn derive_flags(
    analysis: &IpSwitchAnalysis,
    inputs: &FlagInputs,
    checkin: Option<&CheckinAnalysis>,
) -> Vec<String> {
    let mut flags = Vec::new();

    if analysis.rapid_switch_count >= 3 && analysis.avg_ip_duration < 300.0 {
        flags.push("IP_RAPID_SWITCH".to_string());
    }
    if analysis.avg_ip_duration < 30.0
        && analysis.avg_ip_duration > 0.0
        && analysis.real_switch_count >= 3
    {
        flags.push("IP_HOPPING".to_string());
    }
    if inputs.requests_per_minute > 5.0 {
        flags.push("HIGH_RPM".to_string());
    }
    if inputs.unique_ips > 10 {
        flags.push("MANY_IPS".to_string());
    }
    if inputs.failure_rate > 0.5 && inputs.total_requests > 10 {
        flags.push("HIGH_FAILURE_RATE".to_string());
    }
    if let Some(c) = checkin {
        if c.anomalous {
            flags.push("CHECKIN_ANOMALY".to_string());
        }
    }

    flags
}

pub fn analyze_checkins(checkin_count: i64, request_count: i64) -> CheckinAnalysis {
    let requests_per_checkin = if checkin_count > 0 {
        request_count as f64 / checkin_count as f64
    } else {
        0.0
    };
    CheckinAnalysis {
        checkin_count,
        request_count,
        requests_per_checkin,
        anomalous: checkin_count > 3 && requests_per_checkin < 5.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(seq: &[(i64, &str)]) -> Vec<(i64, String)> {
        seq.iter().map(|(t, ip)| (*t, ip.to_string())).collect()
    }

    #[test]
    fn empty_and_single_ip_sequences() {
        let a = analyze_ip_switches(&[]);
        assert_eq!(a.total_switches, 0);

        let a = analyze_ip_switches(&events(&[(0, "1.1.1.1"), (50, "1.1.1.1"), (90, "1.1.1.1")]));
        assert_eq!(a.total_switches, 0);
        assert_eq!(a.unique_ips, 1);
        assert_eq!(a.avg_ip_duration, 0.0);
    }

    #[test]
    fn reference_sequence_classification() {
        // v4 A -> v6 B at 10s (dual stack), -> v4 C at 200s (real),
        // -> v4 D at 210s (real + rapid).
        let a = analyze_ip_switches(&events(&[
            (0, "1.1.1.1"),
            (10, "2001:db8::1"),
            (200, "3.3.3.3"),
            (210, "4.4.4.4"),
        ]));
        assert_eq!(a.dual_stack_switches, 1);
        assert_eq!(a.real_switch_count, 2);
        assert_eq!(a.rapid_switch_count, 1);
        assert_eq!(a.total_switches, 3);
        assert_eq!(a.unique_ips, 4);
        // Durations: A 0->10, B 10->200, C 200->210.
        assert!((a.avg_ip_duration - 70.0).abs() < f64::EPSILON);
        // Dual-stack switch excluded from the minimum.
        assert_eq!(a.min_switch_interval, Some(10));

        let flags = derive_flags(&a, &FlagInputs::default(), None);
        assert!(!flags.contains(&"IP_RAPID_SWITCH".to_string()));
        assert!(!flags.contains(&"IP_HOPPING".to_string()));
    }

    #[test]
    fn slow_v4_v6_transition_is_real() {
        let a = analyze_ip_switches(&events(&[(0, "1.1.1.1"), (120, "2001:db8::1")]));
        assert_eq!(a.dual_stack_switches, 0);
        assert_eq!(a.real_switch_count, 1);
    }

    #[test]
    fn rapid_switching_raises_flag() {
        // Four IPs cycling every 20 seconds.
        let a = analyze_ip_switches(&events(&[
            (0, "1.1.1.1"),
            (20, "2.2.2.2"),
            (40, "3.3.3.3"),
            (60, "4.4.4.4"),
        ]));
        assert_eq!(a.rapid_switch_count, 3);
        assert!(a.avg_ip_duration < 300.0);
        let flags = derive_flags(&a, &FlagInputs::default(), None);
        assert!(flags.contains(&"IP_RAPID_SWITCH".to_string()));
        assert!(flags.contains(&"IP_HOPPING".to_string()));
    }

    #[test]
    fn summary_flags() {
        let inputs = FlagInputs {
            requests_per_minute: 6.5,
            unique_ips: 12,
            total_requests: 100,
            failure_rate: 0.6,
        };
        let flags = derive_flags(&IpSwitchAnalysis::default(), &inputs, None);
        assert!(flags.contains(&"HIGH_RPM".to_string()));
        assert!(flags.contains(&"MANY_IPS".to_string()));
        assert!(flags.contains(&"HIGH_FAILURE_RATE".to_string()));
    }

    #[test]
    fn failure_flag_needs_volume() {
        let inputs = FlagInputs {
            failure_rate: 1.0,
            total_requests: 5,
            ..Default::default()
        };
        let flags = derive_flags(&IpSwitchAnalysis::default(), &inputs, None);
        assert!(!flags.contains(&"HIGH_FAILURE_RATE".to_string()));
    }

    #[test]
    fn checkin_anomaly_detection() {
        let c = analyze_checkins(5, 10);
        assert!(c.anomalous);
        assert_eq!(c.requests_per_checkin, 2.0);

        let c = analyze_checkins(5, 100);
        assert!(!c.anomalous);

        let c = analyze_checkins(2, 1);
        assert!(!c.anomalous, "too few check-ins to matter");

        let flags = derive_flags(
            &IpSwitchAnalysis::default(),
            &FlagInputs::default(),
            Some(&analyze_checkins(5, 10)),
        );
        assert!(flags.contains(&"CHECKIN_ANOMALY".to_string()));
    }

    #[test]
    fn detail_list_is_truncated_to_last_ten() {
        let mut seq = Vec::new();
        for i in 0..20 {
            seq.push((i64::from(i) * 100, format!("10.1.{}.1", i)));
        }
        let a = analyze_ip_switches(&seq);
        assert_eq!(a.total_switches, 19);
        assert_eq!(a.switch_details.len(), 10);
        // Last detail is the final transition.
        assert_eq!(a.switch_details.last().unwrap().to_ip, "10.1.19.1");
    }
}
