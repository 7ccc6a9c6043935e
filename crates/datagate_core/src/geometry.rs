//! Geometry values: WKT/EWKT/WKB parsing, axis flip, centroid and
//! reprojection to WGS84.

use crate::error::{CoreResult, ErrorKind};
use std::f64::consts::PI;
use std::fmt;

/// SRID of WGS84 longitude/latitude.
pub const WGS84: u32 = 4326;
/// SRID of LKS-94 / Lithuania TM.
pub const LKS94: u32 = 3346;
/// SRID of WGS84 / Pseudo-Mercator.
pub const WEB_MERCATOR: u32 = 3857;

/// A 2D coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    /// Easting / longitude.
    pub x: f64,
    /// Northing / latitude.
    pub y: f64,
}

impl Coord {
    /// Creates a coordinate.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    const fn flipped(self) -> Self {
        Self {
            x: self.y,
            y: self.x,
        }
    }
}

/// A simple-features geometry.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    Polygon(Vec<Vec<Coord>>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
}

impl Geometry {
    /// Upper-case WKT type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Point(_) => "POINT",
            Self::LineString(_) => "LINESTRING",
            Self::Polygon(_) => "POLYGON",
            Self::MultiPoint(_) => "MULTIPOINT",
            Self::MultiLineString(_) => "MULTILINESTRING",
            Self::MultiPolygon(_) => "MULTIPOLYGON",
        }
    }

    /// Swaps the axes of every coordinate.
    #[must_use]
    pub fn flip(&self) -> Self {
        self.map_coords(Coord::flipped)
    }

    /// Applies `f` to every coordinate.
    #[must_use]
    pub fn map_coords(&self, f: impl Fn(Coord) -> Coord + Copy) -> Self {
        let line = |l: &Vec<Coord>| l.iter().copied().map(f).collect::<Vec<_>>();
        let poly = |p: &Vec<Vec<Coord>>| p.iter().map(line).collect::<Vec<_>>();
        match self {
            Self::Point(c) => Self::Point(f(*c)),
            Self::LineString(l) => Self::LineString(line(l)),
            Self::Polygon(p) => Self::Polygon(poly(p)),
            Self::MultiPoint(l) => Self::MultiPoint(line(l)),
            Self::MultiLineString(p) => Self::MultiLineString(poly(p)),
            Self::MultiPolygon(m) => Self::MultiPolygon(m.iter().map(poly).collect()),
        }
    }

    /// Centroid. Polygons use the area centroid of their exterior ring,
    /// everything else the mean of its vertices.
    #[must_use]
    pub fn centroid(&self) -> Option<Coord> {
        match self {
            Self::Point(c) => Some(*c),
            Self::LineString(l) | Self::MultiPoint(l) => mean(l.iter()),
            Self::MultiLineString(p) => mean(p.iter().flatten()),
            Self::Polygon(rings) => rings.first().and_then(|r| ring_centroid(r)),
            Self::MultiPolygon(polys) => {
                let mut total = 0.0;
                let (mut sx, mut sy) = (0.0, 0.0);
                for ring in polys.iter().filter_map(|p| p.first()) {
                    let area = ring_area(ring).abs();
                    if let Some(c) = ring_centroid(ring) {
                        sx += c.x * area;
                        sy += c.y * area;
                        total += area;
                    }
                }
                if total > 0.0 {
                    Some(Coord::new(sx / total, sy / total))
                } else {
                    mean(polys.iter().flatten().flatten())
                }
            }
        }
    }

    /// Parses WKT, optionally prefixed with `SRID=n;` (EWKT). Returns the
    /// embedded SRID, if any.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` on malformed input.
    pub fn parse_wkt(text: &str) -> CoreResult<(Option<u32>, Self)> {
        let text = text.trim();
        let (srid, body) = match text.strip_prefix("SRID=") {
            Some(rest) => {
                let (num, body) = rest.split_once(';').ok_or_else(|| invalid(text))?;
                (Some(num.trim().parse().map_err(|_| invalid(text))?), body)
            }
            None => (None, text),
        };
        let mut parser = WktParser {
            src: body,
            pos: 0,
        };
        let geom = parser.geometry().ok_or_else(|| invalid(text))?;
        parser.skip_ws();
        if parser.pos != body.len() {
            return Err(invalid(text));
        }
        Ok((srid, geom))
    }

    /// Parses hex-encoded WKB or EWKB.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` on malformed input.
    pub fn parse_wkb_hex(hex: &str) -> CoreResult<(Option<u32>, Self)> {
        let bytes = decode_hex(hex).ok_or_else(|| invalid(hex))?;
        let mut reader = WkbReader {
            bytes: &bytes,
            pos: 0,
        };
        let result = reader.geometry().ok_or_else(|| invalid(hex))?;
        Ok(result)
    }

    /// Parses WKT/EWKT or hex WKB, whichever `text` looks like.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` on malformed input.
    pub fn parse(text: &str) -> CoreResult<(Option<u32>, Self)> {
        let trimmed = text.trim();
        if !trimmed.is_empty() && trimmed.len() % 2 == 0 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            Self::parse_wkb_hex(trimmed)
        } else {
            Self::parse_wkt(trimmed)
        }
    }

    /// Reprojects into WGS84 longitude/latitude.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for SRIDs without a known projection.
    pub fn to_wgs84(&self, srid: u32) -> CoreResult<Self> {
        match srid {
            WGS84 => Ok(self.clone()),
            WEB_MERCATOR => Ok(self.map_coords(web_mercator_to_wgs84)),
            LKS94 => Ok(self.map_coords(lks94_to_wgs84)),
            other => Err(ErrorKind::InvalidValue
                .err()
                .with("value", other)
                .with("expected", "SRID 4326, 3346 or 3857")
                .into()),
        }
    }
}

fn invalid(text: &str) -> crate::error::CoreError {
    ErrorKind::InvalidValue
        .err()
        .with("value", text)
        .with("expected", "WKT or WKB geometry")
        .into()
}

fn mean<'a>(coords: impl Iterator<Item = &'a Coord>) -> Option<Coord> {
    let (mut n, mut sx, mut sy) = (0.0, 0.0, 0.0);
    for c in coords {
        n += 1.0;
        sx += c.x;
        sy += c.y;
    }
    (n > 0.0).then(|| Coord::new(sx / n, sy / n))
}

fn ring_area(ring: &[Coord]) -> f64 {
    let mut sum = 0.0;
    for w in ring.windows(2) {
        sum += w[0].x * w[1].y - w[1].x * w[0].y;
    }
    sum / 2.0
}

fn ring_centroid(ring: &[Coord]) -> Option<Coord> {
    let area = ring_area(ring);
    if area.abs() < f64::EPSILON {
        return mean(ring.iter());
    }
    let (mut cx, mut cy) = (0.0, 0.0);
    for w in ring.windows(2) {
        let cross = w[0].x * w[1].y - w[1].x * w[0].y;
        cx += (w[0].x + w[1].x) * cross;
        cy += (w[0].y + w[1].y) * cross;
    }
    Some(Coord::new(cx / (6.0 * area), cy / (6.0 * area)))
}

fn web_mercator_to_wgs84(c: Coord) -> Coord {
    const R: f64 = 6_378_137.0;
    let lon = (c.x / R).to_degrees();
    let lat = (2.0 * (c.y / R).exp().atan() - PI / 2.0).to_degrees();
    Coord::new(lon, lat)
}

/// Inverse transverse Mercator on GRS80 with the LKS-94 parameters.
fn lks94_to_wgs84(c: Coord) -> Coord {
    const A: f64 = 6_378_137.0;
    const F: f64 = 1.0 / 298.257_222_101;
    const K0: f64 = 0.9998;
    const LON0: f64 = 24.0;
    const FALSE_EASTING: f64 = 500_000.0;

    let e2 = F * (2.0 - F);
    let ep2 = e2 / (1.0 - e2);
    let m = c.y / K0;
    let mu = m / (A * (1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2.powi(3) / 256.0));
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let sin1 = phi1.sin();
    let cos1 = phi1.cos();
    let tan1 = phi1.tan();
    let c1 = ep2 * cos1 * cos1;
    let t1 = tan1 * tan1;
    let n1 = A / (1.0 - e2 * sin1 * sin1).sqrt();
    let r1 = A * (1.0 - e2) / (1.0 - e2 * sin1 * sin1).powf(1.5);
    let d = (c.x - FALSE_EASTING) / (n1 * K0);

    let lat = phi1
        - (n1 * tan1 / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let lon = (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
        + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d.powi(5)
            / 120.0)
        / cos1;

    Coord::new(LON0 + lon.to_degrees(), lat.to_degrees())
}

/// OpenStreetMap link centered on a WGS84 coordinate.
#[must_use]
pub fn osm_link(c: Coord) -> String {
    format!(
        "https://www.openstreetmap.org/?mlat={lat}&mlon={lon}#map=19/{lat}/{lon}",
        lat = c.y,
        lon = c.x
    )
}

impl fmt::Display for Geometry {
    /// Writes WKT.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn coord(f: &mut fmt::Formatter<'_>, c: &Coord) -> fmt::Result {
            write!(f, "{} {}", c.x, c.y)
        }
        fn line(f: &mut fmt::Formatter<'_>, l: &[Coord]) -> fmt::Result {
            f.write_str("(")?;
            for (i, c) in l.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                coord(f, c)?;
            }
            f.write_str(")")
        }
        fn poly(f: &mut fmt::Formatter<'_>, p: &[Vec<Coord>]) -> fmt::Result {
            f.write_str("(")?;
            for (i, l) in p.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                line(f, l)?;
            }
            f.write_str(")")
        }

        write!(f, "{} ", self.type_name())?;
        match self {
            Self::Point(c) => {
                f.write_str("(")?;
                coord(f, c)?;
                f.write_str(")")
            }
            Self::LineString(l) | Self::MultiPoint(l) => line(f, l),
            Self::Polygon(p) | Self::MultiLineString(p) => poly(f, p),
            Self::MultiPolygon(m) => {
                f.write_str("(")?;
                for (i, p) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    poly(f, p)?;
                }
                f.write_str(")")
            }
        }
    }
}

struct WktParser<'a> {
    src: &'a str,
    pos: usize,
}

impl WktParser<'_> {
    fn skip_ws(&mut self) {
        let rest = &self.src[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, ch: char) -> bool {
        self.skip_ws();
        if self.src[self.pos..].starts_with(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn keyword(&mut self) -> String {
        self.skip_ws();
        let rest = &self.src[self.pos..];
        let len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        self.pos += len;
        rest[..len].to_ascii_uppercase()
    }

    fn number(&mut self) -> Option<f64> {
        self.skip_ws();
        let rest = &self.src[self.pos..];
        let len = rest
            .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')))
            .unwrap_or(rest.len());
        let n = rest[..len].parse().ok()?;
        self.pos += len;
        Some(n)
    }

    fn coord(&mut self) -> Option<Coord> {
        let x = self.number()?;
        let y = self.number()?;
        // Z and M ordinates are dropped.
        while self.number().is_some() {}
        Some(Coord::new(x, y))
    }

    fn list<T>(&mut self, mut item: impl FnMut(&mut Self) -> Option<T>) -> Option<Vec<T>> {
        if !self.eat('(') {
            return None;
        }
        let mut out = vec![item(self)?];
        while self.eat(',') {
            out.push(item(self)?);
        }
        self.eat(')').then_some(out)
    }

    fn line(&mut self) -> Option<Vec<Coord>> {
        self.list(Self::coord)
    }

    fn point_item(&mut self) -> Option<Coord> {
        // MULTIPOINT accepts both `(1 2, 3 4)` and `((1 2), (3 4))`.
        if self.eat('(') {
            let c = self.coord()?;
            return self.eat(')').then_some(c);
        }
        self.coord()
    }

    fn geometry(&mut self) -> Option<Geometry> {
        let kind = self.keyword();
        match kind.as_str() {
            "POINT" => {
                if !self.eat('(') {
                    return None;
                }
                let c = self.coord()?;
                self.eat(')').then_some(Geometry::Point(c))
            }
            "LINESTRING" => self.line().map(Geometry::LineString),
            "POLYGON" => self.list(Self::line).map(Geometry::Polygon),
            "MULTIPOINT" => self.list(Self::point_item).map(Geometry::MultiPoint),
            "MULTILINESTRING" => self.list(Self::line).map(Geometry::MultiLineString),
            "MULTIPOLYGON" => self
                .list(|p| p.list(Self::line))
                .map(Geometry::MultiPolygon),
            _ => None,
        }
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

struct WkbReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl WkbReader<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let slice = self.bytes.get(self.pos..self.pos + N)?;
        self.pos += N;
        slice.try_into().ok()
    }

    fn u32(&mut self, le: bool) -> Option<u32> {
        let b = self.take::<4>()?;
        Some(if le {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        })
    }

    fn f64(&mut self, le: bool) -> Option<f64> {
        let b = self.take::<8>()?;
        Some(if le {
            f64::from_le_bytes(b)
        } else {
            f64::from_be_bytes(b)
        })
    }

    fn coord(&mut self, le: bool, dims: usize) -> Option<Coord> {
        let x = self.f64(le)?;
        let y = self.f64(le)?;
        for _ in 2..dims {
            self.f64(le)?;
        }
        Some(Coord::new(x, y))
    }

    fn coords(&mut self, le: bool, dims: usize) -> Option<Vec<Coord>> {
        let n = self.u32(le)?;
        (0..n).map(|_| self.coord(le, dims)).collect()
    }

    fn rings(&mut self, le: bool, dims: usize) -> Option<Vec<Vec<Coord>>> {
        let n = self.u32(le)?;
        (0..n).map(|_| self.coords(le, dims)).collect()
    }

    fn geometry(&mut self) -> Option<(Option<u32>, Geometry)> {
        let le = self.take::<1>()?[0] == 1;
        let raw = self.u32(le)?;
        let srid = if raw & 0x2000_0000 != 0 {
            Some(self.u32(le)?)
        } else {
            None
        };
        let mut dims = 2;
        if raw & 0x8000_0000 != 0 {
            dims += 1;
        }
        if raw & 0x4000_0000 != 0 {
            dims += 1;
        }
        let base = raw & 0x0FFF_FFFF;
        // ISO WKB encodes Z/M as +1000/+2000/+3000.
        let (base, dims) = match base / 1000 {
            1 | 2 => (base % 1000, dims + 1),
            3 => (base % 1000, dims + 2),
            _ => (base, dims),
        };

        let geom = match base {
            1 => Geometry::Point(self.coord(le, dims)?),
            2 => Geometry::LineString(self.coords(le, dims)?),
            3 => Geometry::Polygon(self.rings(le, dims)?),
            4 | 5 | 6 => {
                let n = self.u32(le)?;
                let parts: Vec<Geometry> = (0..n)
                    .map(|_| self.geometry().map(|(_, g)| g))
                    .collect::<Option<_>>()?;
                match base {
                    4 => Geometry::MultiPoint(
                        parts
                            .into_iter()
                            .map(|g| match g {
                                Geometry::Point(c) => Some(c),
                                _ => None,
                            })
                            .collect::<Option<_>>()?,
                    ),
                    5 => Geometry::MultiLineString(
                        parts
                            .into_iter()
                            .map(|g| match g {
                                Geometry::LineString(l) => Some(l),
                                _ => None,
                            })
                            .collect::<Option<_>>()?,
                    ),
                    _ => Geometry::MultiPolygon(
                        parts
                            .into_iter()
                            .map(|g| match g {
                                Geometry::Polygon(p) => Some(p),
                                _ => None,
                            })
                            .collect::<Option<_>>()?,
                    ),
                }
            }
            _ => return None,
        };
        Some((srid, geom))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wkt_roundtrip() {
        for wkt in [
            "POINT (1 2)",
            "LINESTRING (0 0, 1 1.5)",
            "POLYGON ((0 0, 4 0, 4 4, 0 4, 0 0))",
            "MULTIPOLYGON (((0 0, 1 0, 1 1, 0 0)), ((5 5, 6 5, 6 6, 5 5)))",
        ] {
            let (_, g) = Geometry::parse_wkt(wkt).unwrap();
            assert_eq!(g.to_string(), wkt);
        }
    }

    #[test]
    fn ewkt_srid() {
        let (srid, g) = Geometry::parse_wkt("SRID=3346;POINT(500000 6000000)").unwrap();
        assert_eq!(srid, Some(3346));
        assert_eq!(g, Geometry::Point(Coord::new(500_000.0, 6_000_000.0)));
    }

    #[test]
    fn wkb_point() {
        // POINT (1 2), little endian.
        let hex = "0101000000000000000000F03F0000000000000040";
        let (srid, g) = Geometry::parse(hex).unwrap();
        assert_eq!(srid, None);
        assert_eq!(g, Geometry::Point(Coord::new(1.0, 2.0)));
    }

    #[test]
    fn malformed() {
        assert!(Geometry::parse_wkt("POINT (1)").is_err());
        assert!(Geometry::parse_wkt("CIRCLE (1 2)").is_err());
        assert!(Geometry::parse_wkt("POINT (1 2) trailing").is_err());
    }

    #[test]
    fn polygon_centroid() {
        let (_, g) = Geometry::parse_wkt("POLYGON ((0 0, 4 0, 4 4, 0 4, 0 0))").unwrap();
        assert_eq!(g.centroid(), Some(Coord::new(2.0, 2.0)));
    }

    #[test]
    fn reprojection() {
        let g = Geometry::Point(Coord::new(500_000.0, 6_000_000.0));
        let Geometry::Point(c) = g.to_wgs84(LKS94).unwrap() else {
            panic!("expected point");
        };
        assert!((c.x - 24.0).abs() < 1e-9);
        assert!(c.y > 54.0 && c.y < 54.3);

        let Geometry::Point(c) = Geometry::Point(Coord::new(0.0, 0.0))
            .to_wgs84(WEB_MERCATOR)
            .unwrap()
        else {
            panic!("expected point");
        };
        assert!(c.x.abs() < 1e-9 && c.y.abs() < 1e-9);
        assert!(Geometry::Point(Coord::new(0.0, 0.0)).to_wgs84(2180).is_err());
    }

    proptest! {
        #[test]
        fn flip_twice_is_identity(coords in prop::collection::vec((-1e6f64..1e6, -1e6f64..1e6), 1..10)) {
            let line: Vec<Coord> = coords.into_iter().map(|(x, y)| Coord::new(x, y)).collect();
            let g = Geometry::LineString(line);
            prop_assert_eq!(g.flip().flip(), g);
        }
    }
}
