//! Per-user alert decisions from canonical events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::preferences::{LocatedFix, UserPreferences};
use crate::domain::{AlertDecision, DeliveryMode, EarthquakeEvent, EventId, SeverityTier};
use crate::wave::WaveCalculator;

/// Decision engine parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Location fixes older than this are ignored (default: 600 s)
    pub max_location_age_sec: f64,
    /// Preferences applied when no provider is wired
    pub preferences: UserPreferences,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            max_location_age_sec: 600.0,
            preferences: UserPreferences::default(),
        }
    }
}

/// Relevance radius that grows with magnitude.
pub fn magnitude_radius_km(magnitude: f64) -> f64 {
    if magnitude >= 7.0 {
        2000.0
    } else if magnitude >= 6.0 {
        1000.0
    } else if magnitude >= 5.0 {
        500.0
    } else {
        200.0
    }
}

/// Turns an event plus one user's context into an [`AlertDecision`].
#[derive(Debug, Clone)]
pub struct AlertDecisionEngine {
    calculator: WaveCalculator,
    max_location_age_sec: f64,
}

impl AlertDecisionEngine {
    /// Create an engine
    pub fn new(calculator: WaveCalculator, config: &AlertingConfig) -> Self {
        Self {
            calculator,
            max_location_age_sec: config.max_location_age_sec,
        }
    }

    /// Evaluate one event for one user.
    ///
    /// Returns `None` when the event is unconfirmed, the location is missing
    /// or stale, or the event fails the user's magnitude/distance filters.
    pub fn evaluate(
        &self,
        event: &EarthquakeEvent,
        location: Option<LocatedFix>,
        prefs: &UserPreferences,
        now: DateTime<Utc>,
    ) -> Option<AlertDecision> {
        if !event.is_confirmed() {
            return None;
        }
        let Some(fix) = location else {
            tracing::debug!(event_id = %event.id(), "No user location, decision skipped");
            return None;
        };
        if fix.is_stale(now, self.max_location_age_sec) {
            tracing::debug!(event_id = %event.id(), fix_at = %fix.at, "Stale user location, decision skipped");
            return None;
        }

        let magnitude = event.magnitude();
        if magnitude < prefs.min_magnitude {
            return None;
        }

        let mut max_distance = prefs.max_distance_km;
        if prefs.use_magnitude_radius {
            max_distance = max_distance.min(magnitude_radius_km(magnitude));
        }

        let arrivals = match self.calculator.arrivals(
            &event.hypocenter(),
            event.origin_time(),
            &fix.point,
            magnitude,
            prefs.soil_class,
            now,
        ) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(event_id = %event.id(), error = %e, "Wave calculation failed");
                return None;
            }
        };
        if arrivals.distance_km > max_distance {
            return None;
        }

        let bypass_quiet_hours = magnitude >= prefs.critical_magnitude;
        let delivery_mode = if bypass_quiet_hours {
            DeliveryMode::Critical
        } else if prefs.in_silent_hours(now) {
            DeliveryMode::Silent
        } else {
            DeliveryMode::Standard
        };

        Some(AlertDecision {
            event_id: *event.id(),
            event_revision: event.revision(),
            user_relevant: true,
            distance_km: arrivals.distance_km,
            warning_time_sec: arrivals.warning_time_sec,
            intensity: arrivals.intensity,
            magnitude,
            severity_tier: SeverityTier::from_intensity(arrivals.intensity),
            bypass_quiet_hours,
            delivery_mode,
            computed_at: now,
        })
    }
}

/// Remembers the strongest decision delivered per event.
///
/// A revision may raise severity or delivery mode, never lower them.
#[derive(Debug, Default)]
pub struct DecisionTracker {
    delivered: HashMap<EventId, AlertDecision>,
}

impl DecisionTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a fresh decision into what was already delivered.
    ///
    /// Returns the decision to dispatch if it is the first for the event or
    /// an upgrade over what the user already received.
    pub fn observe(&mut self, decision: AlertDecision) -> Option<AlertDecision> {
        let Some(previous) = self.delivered.get(&decision.event_id) else {
            self.delivered.insert(decision.event_id, decision.clone());
            return Some(decision);
        };

        let mut merged = decision;
        merged.severity_tier = merged.severity_tier.max(previous.severity_tier);
        merged.bypass_quiet_hours |= previous.bypass_quiet_hours;
        merged.delivery_mode = merged.delivery_mode.max(previous.delivery_mode);

        let upgraded =
            merged.severity_tier > previous.severity_tier || merged.delivery_mode > previous.delivery_mode;
        self.delivered.insert(merged.event_id, merged.clone());
        upgraded.then_some(merged)
    }

    /// Strongest decision so far for an event
    pub fn get(&self, event_id: &EventId) -> Option<&AlertDecision> {
        self.delivered.get(event_id)
    }

    /// Forget an event (e.g. after pruning)
    pub fn forget(&mut self, event_id: &EventId) {
        self.delivered.remove(event_id);
    }

    /// Number of tracked events
    pub fn len(&self) -> usize {
        self.delivered.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GeoPoint, SourceId, SourceRank, SourceReport};
    use chrono::{Duration, NaiveTime, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap()
    }

    fn epicenter() -> GeoPoint {
        GeoPoint::new(40.8, 29.0)
    }

    fn event(mag: f64, authoritative: bool) -> EarthquakeEvent {
        let r = SourceReport {
            source_id: SourceId::new("afad"),
            external_event_id: "afad-1".into(),
            magnitude: mag,
            epicenter: epicenter(),
            depth_km: 10.0,
            origin_time: t0(),
            reported_at: t0(),
        };
        EarthquakeEvent::from_report(&r, SourceRank::new(1, authoritative), t0())
    }

    fn user_at(north_km: f64) -> Option<LocatedFix> {
        Some(LocatedFix::new(epicenter().offset_km(north_km, 0.0), t0()))
    }

    fn engine() -> AlertDecisionEngine {
        AlertDecisionEngine::new(WaveCalculator::default(), &AlertingConfig::default())
    }

    #[test]
    fn test_nearby_event_produces_decision() {
        let d = engine()
            .evaluate(&event(6.0, true), user_at(100.0), &UserPreferences::default(), t0())
            .unwrap();
        assert!(d.user_relevant);
        assert!((d.distance_km - 100.0).abs() < 1.0);
        // hypocentral ≈ 100.5 km / 3.5 km/s ≈ 28.7 s
        assert!(d.warning_time_sec > 28.0 && d.warning_time_sec < 29.5);
        assert!(d.bypass_quiet_hours);
        assert_eq!(d.delivery_mode, DeliveryMode::Critical);
    }

    #[test]
    fn test_unconfirmed_event_produces_nothing() {
        assert!(engine()
            .evaluate(&event(6.0, false), user_at(10.0), &UserPreferences::default(), t0())
            .is_none());
    }

    #[test]
    fn test_missing_or_stale_location_produces_nothing() {
        let e = engine();
        let prefs = UserPreferences::default();
        assert!(e.evaluate(&event(6.0, true), None, &prefs, t0()).is_none());
        let old = Some(LocatedFix::new(epicenter(), t0() - Duration::hours(2)));
        assert!(e.evaluate(&event(6.0, true), old, &prefs, t0()).is_none());
    }

    #[test]
    fn test_user_filters() {
        let e = engine();
        let prefs = UserPreferences::default();
        assert!(e.evaluate(&event(3.5, true), user_at(10.0), &prefs, t0()).is_none());
        // M4.5 radius is 200 km even though max_distance_km is 500
        assert!(e.evaluate(&event(4.5, true), user_at(300.0), &prefs, t0()).is_none());
        let wide = UserPreferences {
            use_magnitude_radius: false,
            ..prefs
        };
        assert!(e.evaluate(&event(4.5, true), user_at(300.0), &wide, t0()).is_some());
    }

    #[test]
    fn test_close_moderate_outranks_distant_large() {
        let e = engine();
        let prefs = UserPreferences {
            max_distance_km: 2000.0,
            ..UserPreferences::default()
        };
        let close = e.evaluate(&event(5.5, true), user_at(2.0), &prefs, t0()).unwrap();
        let far = e.evaluate(&event(7.0, true), user_at(1500.0), &prefs, t0()).unwrap();
        assert!(close.severity_tier > far.severity_tier);
    }

    #[test]
    fn test_critical_magnitude_bypasses_silent_hours() {
        let prefs = UserPreferences::default().with_silent_hours(
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        );
        let e = engine();
        let loud = e.evaluate(&event(6.0, true), user_at(50.0), &prefs, t0()).unwrap();
        assert!(loud.bypass_quiet_hours);
        assert_eq!(loud.delivery_mode, DeliveryMode::Critical);

        let quiet = e.evaluate(&event(4.8, true), user_at(50.0), &prefs, t0()).unwrap();
        assert!(!quiet.bypass_quiet_hours);
        assert_eq!(quiet.delivery_mode, DeliveryMode::Silent);
    }

    #[test]
    fn test_tracker_never_downgrades() {
        let e = engine();
        let prefs = UserPreferences::default();
        let mut tracker = DecisionTracker::new();

        let strong = e.evaluate(&event(6.5, true), user_at(20.0), &prefs, t0()).unwrap();
        assert!(tracker.observe(strong.clone()).is_some());

        let revised = e.evaluate(&event(5.0, true), user_at(20.0), &prefs, t0()).unwrap();
        assert!(revised.severity_tier < strong.severity_tier);
        assert!(tracker.observe(revised).is_none());

        let kept = tracker.get(&strong.event_id).unwrap();
        assert_eq!(kept.severity_tier, strong.severity_tier);
        assert!(kept.bypass_quiet_hours);
        assert_eq!(kept.delivery_mode, DeliveryMode::Critical);
    }

    #[test]
    fn test_tracker_redispatches_upgrades() {
        let e = engine();
        let prefs = UserPreferences::default();
        let mut tracker = DecisionTracker::new();
        let ev = event(4.6, true);
        let weak = e.evaluate(&ev, user_at(150.0), &prefs, t0()).unwrap();
        tracker.observe(weak.clone());

        let mut upgraded = weak.clone();
        upgraded.severity_tier = SeverityTier::Extreme;
        assert_eq!(tracker.observe(upgraded).unwrap().severity_tier, SeverityTier::Extreme);
        assert!(tracker.observe(weak).is_none());
    }

    #[test]
    fn test_magnitude_radius_tiers() {
        assert_eq!(magnitude_radius_km(4.9), 200.0);
        assert_eq!(magnitude_radius_km(5.0), 500.0);
        assert_eq!(magnitude_radius_km(6.5), 1000.0);
        assert_eq!(magnitude_radius_km(7.2), 2000.0);
    }
}
