use super::PrimitiveContext;
use crate::{Outcome, Value};

pub fn each(ctx: &mut PrimitiveContext) -> Outcome {
    let range = ctx.receiver_range()?;
    range.each(ctx.ctx, ctx.block)
}

pub fn collect(ctx: &mut PrimitiveContext) -> Outcome {
    let range = ctx.receiver_range()?;
    range.collect(ctx.ctx, ctx.block)
}

pub fn step(ctx: &mut PrimitiveContext) -> Outcome {
    let range = ctx.receiver_range()?;
    let step = ctx.fixnum_input(0)?;
    range.step(ctx.ctx, step, ctx.block)
}

pub fn first(ctx: &mut PrimitiveContext) -> Outcome {
    Ok(Value::Fixnum(ctx.receiver_range()?.first()))
}

pub fn last(ctx: &mut PrimitiveContext) -> Outcome {
    Ok(Value::Fixnum(ctx.receiver_range()?.last()))
}

pub fn exclude_end(ctx: &mut PrimitiveContext) -> Outcome {
    Ok(Value::Bool(ctx.receiver_range()?.exclude_end))
}

pub fn include(ctx: &mut PrimitiveContext) -> Outcome {
    let range = ctx.receiver_range()?;
    Ok(Value::Bool(range.includes(ctx.input(0))))
}

pub fn to_a(ctx: &mut PrimitiveContext) -> Outcome {
    Ok(Value::Array(ctx.receiver_range()?.to_vec()))
}

pub fn to_s(ctx: &mut PrimitiveContext) -> Outcome {
    let range = ctx.receiver_range()?;
    Ok(Value::string(&range.to_string()))
}
