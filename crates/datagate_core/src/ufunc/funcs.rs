//! Built-in value functions.

use super::{value_prop, Arg, ArgKind, CmpOp, Column, ColumnFunc, Cond, Env};
use crate::commands::CommandRegistry;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::geometry::Geometry;
use serde_json::Value;

/// A function implementation over resolved arguments.
pub type Handler = fn(&Env<'_>, Vec<Arg>) -> CoreResult<Arg>;

/// The function table.
pub type FuncRegistry = CommandRegistry<ArgKind, Handler>;

fn bad_args(name: &str) -> CoreError {
    CoreError::internal(format!("{name} called with unexpected arguments"))
}

fn column_and_value(name: &str, args: Vec<Arg>) -> CoreResult<(Column, Value)> {
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some(Arg::Column(c)), Some(Arg::Value(v))) => Ok((c, v)),
        (Some(Arg::Column(c)), Some(Arg::Geometry(wkt))) => Ok((c, Value::String(wkt))),
        _ => Err(bad_args(name)),
    }
}

fn located(env: &Env<'_>, column: &Column) -> (String, String) {
    let prop = env.manifest.property(column.prop);
    (env.manifest.model(prop.model).name.clone(), column.place.clone())
}

fn compare(env: &Env<'_>, op: CmpOp, args: Vec<Arg>) -> CoreResult<Arg> {
    let (column, value) = column_and_value(op.name(), args)?;
    let prop = value_prop(env.manifest, env.manifest.property(column.prop));
    let value = if value.is_null() || !column.funcs.is_empty() {
        value
    } else {
        prop.dtype.load(env.manifest, prop, &value)?
    };
    Ok(Arg::Cond(Cond::Compare { column, op, value }))
}

fn compare_ref(env: &Env<'_>, op: CmpOp, args: Vec<Arg>) -> CoreResult<Arg> {
    let (mut column, value) = column_and_value(op.name(), args)?;
    let target = match &env.manifest.property(column.prop).dtype {
        crate::dtype::DType::Ref(r) => r.model,
        _ => return Err(bad_args(op.name())),
    };
    let id = env
        .manifest
        .find_property(target, "_id")
        .ok_or_else(|| CoreError::internal("model without _id"))?;
    column.prop = id.id;
    column.place = format!("{}._id", column.place);
    Ok(Arg::Cond(Cond::Compare { column, op, value }))
}

fn unsupported(env: &Env<'_>, name: &str, args: Vec<Arg>) -> CoreResult<Arg> {
    let (column, value) = column_and_value(name, args)?;
    let (model, place) = located(env, &column);
    let prop = value_prop(env.manifest, env.manifest.property(column.prop));
    Err(ErrorKind::InvalidValue
        .err()
        .model(&model)
        .property(&place)
        .with("value", value)
        .with("operator", name)
        .with("type", prop.dtype.name())
        .into())
}

macro_rules! handlers {
    ($via:ident: $($name:ident => $variant:ident),* $(,)?) => {
        $(
            fn $name(env: &Env<'_>, args: Vec<Arg>) -> CoreResult<Arg> {
                $via(env, CmpOp::$variant, args)
            }
        )*
    };
}

fn reject(env: &Env<'_>, op: CmpOp, args: Vec<Arg>) -> CoreResult<Arg> {
    unsupported(env, op.name(), args)
}

handlers!(compare: eq => Eq, ne => Ne, lt => Lt, le => Le, gt => Gt, ge => Ge);
handlers!(compare_ref: eq_ref => Eq, ne_ref => Ne);
handlers!(reject: reject_lt => Lt, reject_le => Le, reject_gt => Gt, reject_ge => Ge);

fn text_match(env: &Env<'_>, name: &str, args: Vec<Arg>) -> CoreResult<Arg> {
    let (column, value) = column_and_value(name, args)?;
    let Value::String(text) = value else {
        return unsupported(env, name, vec![Arg::Column(column), Arg::Value(value)]);
    };
    Ok(Arg::Cond(if name == "contains" {
        Cond::Contains { column, value: text }
    } else {
        Cond::StartsWith { column, value: text }
    }))
}

fn contains(env: &Env<'_>, args: Vec<Arg>) -> CoreResult<Arg> {
    text_match(env, "contains", args)
}

fn startswith(env: &Env<'_>, args: Vec<Arg>) -> CoreResult<Arg> {
    text_match(env, "startswith", args)
}

fn reject_contains(env: &Env<'_>, args: Vec<Arg>) -> CoreResult<Arg> {
    unsupported(env, "contains", args)
}

fn reject_startswith(env: &Env<'_>, args: Vec<Arg>) -> CoreResult<Arg> {
    unsupported(env, "startswith", args)
}

fn with_func(func: ColumnFunc, args: Vec<Arg>) -> CoreResult<Arg> {
    match args.into_iter().next() {
        Some(Arg::Column(mut c)) => {
            c.funcs.push(func);
            Ok(Arg::Column(c))
        }
        _ => Err(bad_args(func.name())),
    }
}

fn lower(_env: &Env<'_>, args: Vec<Arg>) -> CoreResult<Arg> {
    with_func(ColumnFunc::Lower, args)
}

fn upper(_env: &Env<'_>, args: Vec<Arg>) -> CoreResult<Arg> {
    with_func(ColumnFunc::Upper, args)
}

fn flip_column(_env: &Env<'_>, args: Vec<Arg>) -> CoreResult<Arg> {
    with_func(ColumnFunc::Flip, args)
}

fn flip_value(_env: &Env<'_>, args: Vec<Arg>) -> CoreResult<Arg> {
    match args.into_iter().next() {
        Some(Arg::Geometry(wkt)) => {
            let (_, geom) = Geometry::parse_wkt(&wkt)?;
            Ok(Arg::Geometry(geom.flip().to_string()))
        }
        _ => Err(bad_args("flip")),
    }
}

fn point(_env: &Env<'_>, args: Vec<Arg>) -> CoreResult<Arg> {
    let coords: Vec<f64> = args
        .iter()
        .filter_map(|a| match a {
            Arg::Value(v) => v.as_f64(),
            _ => None,
        })
        .collect();
    match coords.as_slice() {
        [x, y] => Ok(Arg::Geometry(
            Geometry::Point(crate::geometry::Coord { x: *x, y: *y }).to_string(),
        )),
        _ => Err(bad_args("point")),
    }
}

/// Builds the table of built-in functions.
///
/// # Errors
///
/// Returns an internal error if two built-ins clash.
pub fn builtins() -> CoreResult<FuncRegistry> {
    use ArgKind::{
        Column, DateColumn, Geometry, GeometryColumn, Number, NumberColumn, RefColumn, Text,
        TextColumn, Value,
    };
    let mut reg = FuncRegistry::new();

    let equality: [(&str, Handler, Handler); 2] = [("eq", eq, eq_ref), ("ne", ne, ne_ref)];
    for (name, ok, by_ref) in equality {
        reg.register(name, &[Column, Value], ok)?;
        reg.register(name, &[RefColumn, Text], by_ref)?;
        reg.register(name, &[GeometryColumn, Geometry], ok)?;
    }

    let ordering: [(&str, Handler, Handler); 4] = [
        ("lt", lt, reject_lt),
        ("le", le, reject_le),
        ("gt", gt, reject_gt),
        ("ge", ge, reject_ge),
    ];
    for (name, ok, reject) in ordering {
        reg.register(name, &[Column, Value], reject)?;
        reg.register(name, &[NumberColumn, Number], ok)?;
        reg.register(name, &[DateColumn, Text], ok)?;
    }

    reg.register("contains", &[Column, Value], reject_contains)?;
    reg.register("contains", &[TextColumn, Text], contains)?;
    reg.register("startswith", &[Column, Value], reject_startswith)?;
    reg.register("startswith", &[TextColumn, Text], startswith)?;

    reg.register("lower", &[TextColumn], lower)?;
    reg.register("upper", &[TextColumn], upper)?;
    reg.register("flip", &[GeometryColumn], flip_column)?;
    reg.register("flip", &[Geometry], flip_value)?;
    reg.register("point", &[Number, Number], point)?;
    Ok(reg)
}
