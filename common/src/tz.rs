use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Resuelve un nombre IANA. Devuelve `None` si no existe.
pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}

/// Nombre canónico de la zona, o "UTC" si el nombre no se reconoce.
/// El booleano indica si hubo que caer a UTC.
pub fn resolve_timezone(name: &str) -> (String, bool) {
    match parse_timezone(name) {
        Some(tz) => (tz.name().to_string(), false),
        None => ("UTC".to_string(), true),
    }
}

/// Convierte una hora local de pared en la zona del job al instante UTC.
///
/// Horas ambiguas (cambio de horario hacia atrás) toman el instante más temprano;
/// horas inexistentes (salto hacia adelante) devuelven `None`.
pub fn local_to_utc(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}
