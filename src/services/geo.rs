use crate::models::Location;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points in kilometres
pub fn haversine_km(from: Location, to: Location) -> f64 {
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();
    let dlat = (to.lat - from.lat).to_radians();
    let dlng = (to.lng - from.lng).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Multiplier applied to a blended score for how far away a restaurant is
pub fn location_factor(distance_km: f64) -> f64 {
    if distance_km < 1.0 {
        1.2
    } else if distance_km < 5.0 {
        1.0
    } else if distance_km < 10.0 {
        0.8
    } else {
        0.3
    }
}
